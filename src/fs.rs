use std::cell::RefCell;

/// Receives each completed output line, without its trailing newline.
pub type LineSink = Box<dyn Fn(&str)>;

/// Console-output collector backing the guest-visible `fs` object; one
/// buffer serves every fd, flushed to the sink at each newline.
pub struct SysFs {
    out: RefCell<Vec<u8>>,
    sink: RefCell<LineSink>,
}

impl SysFs {
    pub fn new() -> Self {
        Self {
            out: RefCell::new(Vec::new()),
            sink: RefCell::new(Box::new(|line| println!("{line}"))),
        }
    }

    /// Replace the default stdout sink.
    pub fn set_sink(&self, sink: LineSink) {
        *self.sink.borrow_mut() = sink;
    }

    /// Buffered write; returns the number of bytes accepted.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let flushed = {
            let mut out = self.out.borrow_mut();
            out.extend_from_slice(bytes);
            match out.iter().rposition(|&b| b == b'\n') {
                Some(nl) => {
                    let mut line: Vec<u8> = out.drain(..=nl).collect();
                    line.pop();
                    Some(line)
                }
                None => None,
            }
        };
        if let Some(line) = flushed {
            self.emit_line(&String::from_utf8_lossy(&line));
        }
        bytes.len()
    }

    /// Push a complete line straight to the sink, bypassing the buffer.
    pub fn emit_line(&self, line: &str) {
        self.sink.borrow()(line);
    }

    /// Bytes written since the last newline.
    pub fn pending(&self) -> Vec<u8> {
        self.out.borrow().clone()
    }
}

impl Default for SysFs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn capture() -> (SysFs, Rc<RefCell<Vec<String>>>) {
        let fs = SysFs::new();
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = lines.clone();
        fs.set_sink(Box::new(move |line| sink.borrow_mut().push(line.to_string())));
        (fs, lines)
    }

    #[test]
    fn emits_up_to_last_newline_and_buffers_the_rest() {
        let (fs, lines) = capture();
        assert_eq!(fs.write(b"a\nb"), 3);
        assert_eq!(*lines.borrow(), ["a"]);
        assert_eq!(fs.pending(), b"b");

        fs.write(b"\n");
        assert_eq!(*lines.borrow(), ["a", "b"]);
        assert!(fs.pending().is_empty());
    }

    #[test]
    fn multiple_newlines_flush_as_one_chunk() {
        let (fs, lines) = capture();
        fs.write(b"one\ntwo\nthr");
        assert_eq!(*lines.borrow(), ["one\ntwo"]);
        assert_eq!(fs.pending(), b"thr");
    }

    #[test]
    fn writes_without_newline_stay_buffered() {
        let (fs, lines) = capture();
        fs.write(b"partial");
        assert!(lines.borrow().is_empty());
        assert_eq!(fs.pending(), b"partial");
    }
}
