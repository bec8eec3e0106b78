//! Byte stream to command lines, with realtime bytes picked out on the fly.
//!
//! Realtime bytes (`0x18`, `?`, `!`, `~`) never enter a line and are reported
//! to the sink the moment they are seen, even in the middle of a line or a
//! comment. Everything else is assembled into bounded lines.

use heapless::{Deque, String};
use serde::Serialize;

use crate::config::{LINE_MAX, LINE_QUEUE_DEPTH, LineDelivery, ProtocolConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RealtimeCommand {
    Reset,
    StatusQuery,
    FeedHold,
    CycleStart,
}

impl RealtimeCommand {
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x18 => Some(Self::Reset),
            b'?' => Some(Self::StatusQuery),
            b'!' => Some(Self::FeedHold),
            b'~' => Some(Self::CycleStart),
            _ => None,
        }
    }

    pub const fn byte(self) -> u8 {
        match self {
            Self::Reset => 0x18,
            Self::StatusQuery => b'?',
            Self::FeedHold => b'!',
            Self::CycleStart => b'~',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LineStatus {
    Ok,
    /// Blank or suppressed. Never delivered, kept for callers that classify.
    Empty,
    /// The line outgrew `LINE_MAX`; the text holds the first `LINE_MAX` bytes.
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    text: String<LINE_MAX>,
    status: LineStatus,
}

impl Line {
    pub fn as_str(&self) -> &str {
        self.text.as_str()
    }

    pub fn status(&self) -> LineStatus {
        self.status
    }

    pub fn is_overflow(&self) -> bool {
        self.status == LineStatus::Overflow
    }
}

/// Receiver for framer output.
pub trait FrameSink {
    fn realtime(&mut self, cmd: RealtimeCommand);

    /// Only called in [`LineDelivery::Immediate`] mode.
    fn line(&mut self, _line: Line) {}
}

#[derive(Debug)]
pub struct Framer {
    config: ProtocolConfig,
    cur: String<LINE_MAX>,
    overflow: bool,
    in_paren: bool,
    in_semicolon: bool,
    queue: Deque<Line, LINE_QUEUE_DEPTH>,
    dropped: u32,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(ProtocolConfig::default())
    }
}

impl Framer {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            cur: String::new(),
            overflow: false,
            in_paren: false,
            in_semicolon: false,
            queue: Deque::new(),
            dropped: 0,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Lines lost because the queue was full.
    pub fn dropped_lines(&self) -> u32 {
        self.dropped
    }

    /// Consume `bytes`. Partial lines carry over to the next call.
    pub fn feed<S: FrameSink + ?Sized>(&mut self, bytes: &[u8], sink: &mut S) {
        for &b in bytes {
            if let Some(cmd) = RealtimeCommand::from_byte(b) {
                sink.realtime(cmd);
                if cmd == RealtimeCommand::Reset {
                    self.reset();
                }
                continue;
            }

            match b {
                b'\n' => {
                    self.emit_line(sink);
                    continue;
                }
                b'\r' => continue,
                b'\t' | 0x20..=0x7e => {}
                _ => continue,
            }

            if self.in_semicolon {
                continue;
            }

            if self.config.strip_paren_comments {
                if self.in_paren {
                    if b == b')' {
                        self.in_paren = false;
                    }
                    continue;
                }
                if b == b'(' {
                    self.in_paren = true;
                    continue;
                }
            }

            if self.config.strip_semicolon_comments && b == b';' {
                self.in_semicolon = true;
                continue;
            }

            let ch = if self.config.to_uppercase {
                b.to_ascii_uppercase()
            } else {
                b
            };

            // blanks past the limit would be trimmed anyway
            if self.cur.push(char::from(ch)).is_err() && !matches!(ch, b' ' | b'\t') {
                self.overflow = true;
            }
        }
    }

    pub fn pop_line(&mut self) -> Option<Line> {
        self.queue.pop_front()
    }

    pub fn has_line(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queued_lines(&self) -> usize {
        self.queue.len()
    }

    /// Drop the partial line and every queued line.
    pub fn reset(&mut self) {
        self.clear_assembly();
        self.queue.clear();
    }

    fn clear_assembly(&mut self) {
        self.cur.clear();
        self.overflow = false;
        self.in_paren = false;
        self.in_semicolon = false;
    }

    fn emit_line<S: FrameSink + ?Sized>(&mut self, sink: &mut S) {
        let line = if self.overflow {
            Some(Line {
                text: self.cur.clone(),
                status: LineStatus::Overflow,
            })
        } else {
            let trimmed = self.cur.trim_matches(|c| c == ' ' || c == '\t');
            let suppressed = !self.config.allow_dollar_commands && trimmed.starts_with('$');
            if trimmed.is_empty() || suppressed {
                None
            } else {
                let mut text = String::new();
                // trimmed is a slice of a LINE_MAX buffer, so it always fits
                let _ = text.push_str(trimmed);
                Some(Line {
                    text,
                    status: LineStatus::Ok,
                })
            }
        };
        self.clear_assembly();

        let Some(line) = line else {
            return;
        };
        match self.config.delivery {
            LineDelivery::Immediate => sink.line(line),
            LineDelivery::Queue => {
                if self.queue.push_back(line).is_err() {
                    self.dropped = self.dropped.saturating_add(1);
                    console_warn!("line queue full, dropped incoming line");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        realtime: Vec<RealtimeCommand>,
        lines: Vec<Line>,
    }

    impl FrameSink for Recorder {
        fn realtime(&mut self, cmd: RealtimeCommand) {
            self.realtime.push(cmd);
        }

        fn line(&mut self, line: Line) {
            self.lines.push(line);
        }
    }

    fn drain(framer: &mut Framer) -> Vec<(std::string::String, LineStatus)> {
        let mut out = Vec::new();
        while let Some(line) = framer.pop_line() {
            out.push((line.as_str().to_owned(), line.status()));
        }
        out
    }

    #[test]
    fn trims_uppercases_and_strips_comments() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        framer.feed(b"  g1 x10 (move) y5 ; tail\r\n\t\n   \n", &mut rec);
        assert_eq!(drain(&mut framer), vec![("G1 X10  Y5".to_owned(), LineStatus::Ok)]);
        assert!(rec.realtime.is_empty());
    }

    #[test]
    fn partial_lines_survive_across_feeds() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        framer.feed(b"G0 X", &mut rec);
        assert!(!framer.has_line());
        framer.feed(b"12\n", &mut rec);
        assert_eq!(drain(&mut framer), vec![("G0 X12".to_owned(), LineStatus::Ok)]);
    }

    #[test]
    fn realtime_bytes_do_not_disturb_the_line() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        framer.feed(b"G1 X?1!0~\n", &mut rec);
        assert_eq!(
            rec.realtime,
            vec![
                RealtimeCommand::StatusQuery,
                RealtimeCommand::FeedHold,
                RealtimeCommand::CycleStart
            ]
        );
        assert_eq!(drain(&mut framer), vec![("G1 X10".to_owned(), LineStatus::Ok)]);
    }

    #[test]
    fn reset_discards_partial_line_and_queue() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        framer.feed(b"G0 X1\nG0 Y", &mut rec);
        assert_eq!(framer.queued_lines(), 1);
        framer.feed(&[0x18], &mut rec);
        assert_eq!(rec.realtime, vec![RealtimeCommand::Reset]);
        assert!(!framer.has_line());
        framer.feed(b"2\n", &mut rec);
        assert_eq!(drain(&mut framer), vec![("2".to_owned(), LineStatus::Ok)]);
    }

    #[test]
    fn long_lines_are_tagged_not_dropped() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        let long = vec![b'X'; LINE_MAX + 20];
        framer.feed(&long, &mut rec);
        framer.feed(b"\nG0\n", &mut rec);
        let lines = drain(&mut framer);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].1, LineStatus::Overflow);
        assert_eq!(lines[0].0.len(), LINE_MAX);
        assert_eq!(lines[1], ("G0".to_owned(), LineStatus::Ok));
    }

    #[test]
    fn trailing_blanks_past_the_limit_do_not_overflow() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        let mut line = vec![b'X'; LINE_MAX];
        line.extend_from_slice(b"  \t \n");
        framer.feed(&line, &mut rec);

        let mut full = vec![b'Y'; LINE_MAX];
        full.extend_from_slice(b"  Z\n");
        framer.feed(&full, &mut rec);

        let lines = drain(&mut framer);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].1, LineStatus::Ok);
        assert_eq!(lines[0].0.len(), LINE_MAX);
        assert_eq!(lines[1].1, LineStatus::Overflow);
    }

    #[test]
    fn control_bytes_are_dropped_without_ending_the_line() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        framer.feed(b"G0\x01 X\x7f1\n", &mut rec);
        assert_eq!(drain(&mut framer), vec![("G0 X1".to_owned(), LineStatus::Ok)]);
    }

    #[test]
    fn semicolon_comment_spans_feeds_and_keeps_realtime() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        framer.feed(b"G0 X1 ; note", &mut rec);
        framer.feed(b" more ! text\nG0 Y2\n", &mut rec);
        assert_eq!(rec.realtime, vec![RealtimeCommand::FeedHold]);
        assert_eq!(
            drain(&mut framer),
            vec![("G0 X1".to_owned(), LineStatus::Ok), ("G0 Y2".to_owned(), LineStatus::Ok)]
        );
    }

    #[test]
    fn unterminated_paren_comment_ends_with_the_line() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        framer.feed(b"G0 X1 (open\nG0 Y2\n", &mut rec);
        assert_eq!(
            drain(&mut framer),
            vec![("G0 X1".to_owned(), LineStatus::Ok), ("G0 Y2".to_owned(), LineStatus::Ok)]
        );
    }

    #[test]
    fn config_switches_are_honoured() {
        let config = ProtocolConfig {
            to_uppercase: false,
            strip_paren_comments: false,
            strip_semicolon_comments: false,
            allow_dollar_commands: false,
            delivery: LineDelivery::Queue,
        };
        let mut framer = Framer::new(config);
        let mut rec = Recorder::default();
        framer.feed(b"$H\ng0 (a) ;b\n", &mut rec);
        assert_eq!(drain(&mut framer), vec![("g0 (a) ;b".to_owned(), LineStatus::Ok)]);
    }

    #[test]
    fn dollar_lines_pass_when_allowed() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        framer.feed(b"$x\n", &mut rec);
        assert_eq!(drain(&mut framer), vec![("$X".to_owned(), LineStatus::Ok)]);
    }

    #[test]
    fn full_queue_drops_newest() {
        let mut framer = Framer::default();
        let mut rec = Recorder::default();
        for i in 0..LINE_QUEUE_DEPTH + 2 {
            framer.feed(format!("N{i}\n").as_bytes(), &mut rec);
        }
        assert_eq!(framer.dropped_lines(), 2);
        let lines = drain(&mut framer);
        assert_eq!(lines.len(), LINE_QUEUE_DEPTH);
        assert_eq!(lines[0].0, "N0");
        assert_eq!(lines[LINE_QUEUE_DEPTH - 1].0, format!("N{}", LINE_QUEUE_DEPTH - 1));
    }

    #[test]
    fn immediate_delivery_bypasses_the_queue() {
        let config = ProtocolConfig {
            delivery: LineDelivery::Immediate,
            ..ProtocolConfig::default()
        };
        let mut framer = Framer::new(config);
        let mut rec = Recorder::default();
        framer.feed(b"G0 X1\nG0 X2\n", &mut rec);
        assert!(!framer.has_line());
        let texts: Vec<_> = rec.lines.iter().map(|l| l.as_str().to_owned()).collect();
        assert_eq!(texts, vec!["G0 X1", "G0 X2"]);
    }

    #[test]
    fn realtime_byte_mapping() {
        for cmd in [
            RealtimeCommand::Reset,
            RealtimeCommand::StatusQuery,
            RealtimeCommand::FeedHold,
            RealtimeCommand::CycleStart,
        ] {
            assert_eq!(RealtimeCommand::from_byte(cmd.byte()), Some(cmd));
        }
        assert_eq!(RealtimeCommand::from_byte(b'G'), None);
    }
}
