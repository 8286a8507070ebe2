//! Pseudo-terminal request parameters.

/// Baud rate advertised for both directions of the remote tty.
pub const TTY_SPEED: u32 = 14400;

/// A pseudo-terminal to allocate on a channel before running a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub rows: u32,
    pub cols: u32,
    pub echo: bool,
    pub input_speed: u32,
    pub output_speed: u32,
}

impl PtyRequest {
    /// The terminal used for prompt-driven commands: 40x80 `xterm`, echo off
    /// so answers written to stdin are not read back as output.
    pub fn interactive() -> Self {
        Self {
            term: "xterm".to_string(),
            rows: 40,
            cols: 80,
            echo: false,
            input_speed: TTY_SPEED,
            output_speed: TTY_SPEED,
        }
    }
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self::interactive()
    }
}
