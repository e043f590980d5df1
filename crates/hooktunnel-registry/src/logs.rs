//! Log tailing

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// The last `max_lines` lines of `path`, newline terminated
pub fn tail_lines(path: &Path, max_lines: usize) -> io::Result<String> {
    let reader = BufReader::new(File::open(path)?);
    let mut window: VecDeque<String> = VecDeque::with_capacity(max_lines.min(1024));

    for line in reader.split(b'\n') {
        let line = line?;
        if max_lines == 0 {
            continue;
        }
        if window.len() == max_lines {
            window.pop_front();
        }
        window.push_back(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string());
    }

    let mut out = String::new();
    for line in window {
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}
