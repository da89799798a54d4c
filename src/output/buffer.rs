//! Per-task output buffers: bounded tail for display, full log for reports.

use std::collections::VecDeque;
use std::sync::Arc;

/// One captured line, tagged with the group that was open when it was
/// written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub group: Option<Arc<str>>,
    pub text: String,
}

/// Captured output of one task.
#[derive(Debug, Default)]
pub(crate) struct TaskBuffer {
    /// Last `limit` lines, for live display and error reports.
    tail: VecDeque<OutputLine>,
    /// Everything, retained until the scope terminates.
    full: Vec<OutputLine>,
    /// Bytes of an unterminated trailing line.
    partial: String,
    /// Stack of open group labels; the innermost tags new lines.
    groups: Vec<Arc<str>>,
}

impl TaskBuffer {
    pub(crate) fn append(&mut self, bytes: &[u8], tail_limit: usize) {
        self.partial.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = self.partial.find('\n') {
            let rest = self.partial.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.partial, rest);
            line.truncate(line.len() - 1); // drop '\n'
            if line.ends_with('\r') {
                line.truncate(line.len() - 1);
            }
            self.push_line(line, tail_limit);
        }
    }

    /// Promote an unterminated trailing line when the task's stream closes.
    pub(crate) fn flush_partial(&mut self, tail_limit: usize) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.push_line(line, tail_limit);
        }
    }

    fn push_line(&mut self, text: String, tail_limit: usize) {
        let line = OutputLine {
            group: self.groups.last().cloned(),
            text,
        };
        if self.tail.len() == tail_limit {
            self.tail.pop_front();
        }
        self.tail.push_back(line.clone());
        self.full.push(line);
    }

    pub(crate) fn push_group(&mut self, name: Arc<str>) {
        self.groups.push(name);
    }

    pub(crate) fn pop_group(&mut self) {
        self.groups.pop();
    }

    pub(crate) fn tail(&self) -> Vec<OutputLine> {
        self.tail.iter().cloned().collect()
    }

    pub(crate) fn full(&self) -> Vec<OutputLine> {
        self.full.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunks() {
        let mut buffer = TaskBuffer::default();
        buffer.append(b"hel", 30);
        buffer.append(b"lo\nwor", 30);
        buffer.append(b"ld\n", 30);
        let lines: Vec<_> = buffer.tail().into_iter().map(|l| l.text).collect();
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[test]
    fn tail_is_bounded_full_is_not() {
        let mut buffer = TaskBuffer::default();
        for i in 0..10 {
            buffer.append(format!("line {}\n", i).as_bytes(), 3);
        }
        let tail: Vec<_> = buffer.tail().into_iter().map(|l| l.text).collect();
        assert_eq!(tail, vec!["line 7", "line 8", "line 9"]);
        assert_eq!(buffer.full().len(), 10);
    }

    #[test]
    fn group_tags_lines_written_inside_it() {
        let mut buffer = TaskBuffer::default();
        buffer.append(b"before\n", 30);
        buffer.push_group("compile".into());
        buffer.append(b"inside\n", 30);
        buffer.pop_group();
        buffer.append(b"after\n", 30);

        let lines = buffer.tail();
        assert_eq!(lines[0].group, None);
        assert_eq!(lines[1].group.as_deref(), Some("compile"));
        assert_eq!(lines[2].group, None);
    }

    #[test]
    fn partial_line_flushes_on_close() {
        let mut buffer = TaskBuffer::default();
        buffer.append(b"no newline", 30);
        assert!(buffer.tail().is_empty());
        buffer.flush_partial(30);
        assert_eq!(buffer.tail()[0].text, "no newline");
    }

    #[test]
    fn crlf_is_normalized() {
        let mut buffer = TaskBuffer::default();
        buffer.append(b"windows\r\n", 30);
        assert_eq!(buffer.tail()[0].text, "windows");
    }
}
