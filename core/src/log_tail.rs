/// Newline-joined tail of everything a worker printed, capped in characters.
#[derive(Debug, Clone)]
pub struct LogTail {
    buf: String,
    chars: usize,
    max_chars: usize,
}

impl LogTail {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buf: String::new(),
            chars: 0,
            max_chars,
        }
    }

    /// Appends `line` plus a newline, dropping the oldest characters when the
    /// cap is exceeded.
    pub fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        self.chars += line.chars().count() + 1;

        if self.chars > self.max_chars {
            let excess = self.chars - self.max_chars;
            let cut = self
                .buf
                .char_indices()
                .nth(excess)
                .map_or(self.buf.len(), |(idx, _)| idx);
            self.buf.drain(..cut);
            self.chars = self.max_chars;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn char_len(&self) -> usize {
        self.chars
    }
}
