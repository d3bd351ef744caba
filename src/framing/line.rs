//! Newline-delimited framing

use super::{BoundaryDetector, DetectorFactory, Detection};

/// Length of the line text, without the trailing `\n` or `\r\n`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineInfo {
    pub text_len: usize,
}

/// Boundary detector for `\n`-terminated lines
#[derive(Debug, Clone)]
pub struct LineDetector {
    max_line: usize,
}

impl LineDetector {
    pub fn new(max_line: usize) -> Self {
        Self { max_line }
    }

    pub fn factory(self) -> DetectorFactory<LineDetector> {
        DetectorFactory::new(self)
    }
}

impl Default for LineDetector {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl BoundaryDetector for LineDetector {
    type Meta = LineInfo;

    fn detect(&mut self, bytes: &[u8], meta: &mut LineInfo) -> Detection {
        match bytes.iter().position(|&b| b == b'\n') {
            Some(pos) if pos >= self.max_line => {
                Detection::Malformed(format!("line exceeds {} bytes", self.max_line))
            }
            Some(pos) => {
                meta.text_len = if pos > 0 && bytes[pos - 1] == b'\r' {
                    pos - 1
                } else {
                    pos
                };
                Detection::Complete(pos + 1)
            }
            None if bytes.len() >= self.max_line => {
                Detection::Malformed(format!("line exceeds {} bytes", self.max_line))
            }
            None => Detection::Incomplete,
        }
    }
}
