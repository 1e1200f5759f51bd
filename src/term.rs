//! TTY probes used to decide between interactive and pipeline behavior.

use std::io::{stderr, stdin, stdout, IsTerminal};

pub fn is_input_tty() -> bool {
    stdin().is_terminal()
}

pub fn is_output_tty() -> bool {
    stdout().is_terminal()
}

pub fn is_stderr_tty() -> bool {
    stderr().is_terminal()
}
