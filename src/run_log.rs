//! Plain-text per-step run log.
//!
//! ```text
//! model_id=meta-llama/Meta-Llama-3-8B-Instruct
//! layer=20 k=0.8 min=0.0 max=0.3
//!
//! [t=0] H=2.371 sigma=0.300 token='The'
//! [t=1] H=5.002 sigma=0.160 token=' the'
//! ```
//!
//! Downstream parsers read this byte for byte, so floats and token quoting
//! follow Python's `repr`.

use crate::config::ControllerConfig;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use unicode_general_category::{get_general_category, GeneralCategory};

pub struct RunLog<W: Write> {
    out: W,
}

impl RunLog<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> RunLog<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_header(
        &mut self,
        model_id: &str,
        layer_idx: usize,
        controller: &ControllerConfig,
    ) -> io::Result<()> {
        writeln!(self.out, "model_id={model_id}")?;
        writeln!(self.out, "{}", header_params_line(layer_idx, controller))?;
        writeln!(self.out)
    }

    pub fn write_step(&mut self, step: usize, entropy: f64, sigma: f64, token: &str) -> io::Result<()> {
        writeln!(self.out, "{}", step_line(step, entropy, sigma, token))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// `layer=<idx> k=<k> min=<min_sigma> max=<max_sigma>`
pub fn header_params_line(layer_idx: usize, controller: &ControllerConfig) -> String {
    format!(
        "layer={} k={} min={} max={}",
        layer_idx,
        py_float(controller.k),
        py_float(controller.min_sigma),
        py_float(controller.max_sigma)
    )
}

/// `[t=<step>] H=<entropy:.3> sigma=<sigma:.3> token=<repr>`
pub fn step_line(step: usize, entropy: f64, sigma: f64, token: &str) -> String {
    format!("[t={step}] H={entropy:.3} sigma={sigma:.3} token={}", py_repr(token))
}

/// Python `str(float)`: shortest round-trip digits, `.0` on integral values.
pub fn py_float(x: f64) -> String {
    if x.is_nan() {
        "nan".to_string()
    } else if x.is_infinite() {
        (if x > 0.0 { "inf" } else { "-inf" }).to_string()
    } else if x.fract() == 0.0 && x.abs() < 1e16 {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}

/// Python `repr(str)`.
///
/// Single quotes unless the text has a `'` and no `"`. Backslash, the chosen
/// quote, `\n`, `\r` and `\t` get short escapes; other non-printable code
/// points get `\xNN`, `\uNNNN` or `\UNNNNNNNN`.
pub fn py_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if is_printable(c) => out.push(c),
            c => {
                let cp = c as u32;
                let escaped = if cp <= 0xff {
                    format!("\\x{cp:02x}")
                } else if cp <= 0xffff {
                    format!("\\u{cp:04x}")
                } else {
                    format!("\\U{cp:08x}")
                };
                out.push_str(&escaped);
            }
        }
    }
    out.push(quote);
    out
}

// Python's str.isprintable(): everything except the "Other" and
// "Separator" categories, with ' ' allowed.
fn is_printable(c: char) -> bool {
    if c == ' ' {
        return true;
    }
    !matches!(
        get_general_category(c),
        GeneralCategory::Control
            | GeneralCategory::Format
            | GeneralCategory::Surrogate
            | GeneralCategory::PrivateUse
            | GeneralCategory::Unassigned
            | GeneralCategory::LineSeparator
            | GeneralCategory::ParagraphSeparator
            | GeneralCategory::SpaceSeparator
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_line_format() {
        assert_eq!(
            step_line(7, 3.142, 0.123, " the"),
            "[t=7] H=3.142 sigma=0.123 token=' the'"
        );
    }

    #[test]
    fn test_step_line_rounds_to_three_places() {
        assert_eq!(
            step_line(0, 2.0, 0.3, "A"),
            "[t=0] H=2.000 sigma=0.300 token='A'"
        );
        assert_eq!(
            step_line(12, 0.00049, 0.16, "x"),
            "[t=12] H=0.000 sigma=0.160 token='x'"
        );
    }

    #[test]
    fn test_header_matches_python_formatting() {
        let mut log = RunLog::new(Vec::new());
        log.write_header("meta-llama/Meta-Llama-3-8B-Instruct", 20, &ControllerConfig::new(0.8, 0.0, 0.3))
            .unwrap();
        let text = String::from_utf8(log.into_inner()).unwrap();
        assert_eq!(
            text,
            "model_id=meta-llama/Meta-Llama-3-8B-Instruct\nlayer=20 k=0.8 min=0.0 max=0.3\n\n"
        );
    }

    #[test]
    fn test_py_float() {
        assert_eq!(py_float(0.0), "0.0");
        assert_eq!(py_float(1.0), "1.0");
        assert_eq!(py_float(0.8), "0.8");
        assert_eq!(py_float(0.05), "0.05");
        assert_eq!(py_float(2.5), "2.5");
    }

    #[test]
    fn test_py_repr_quoting() {
        assert_eq!(py_repr(" the"), "' the'");
        assert_eq!(py_repr("don't"), "\"don't\"");
        assert_eq!(py_repr("say \"hi\""), "'say \"hi\"'");
        assert_eq!(py_repr("it's \"x\""), "'it\\'s \"x\"'");
        assert_eq!(py_repr(""), "''");
    }

    #[test]
    fn test_py_repr_escapes() {
        assert_eq!(py_repr("\n"), "'\\n'");
        assert_eq!(py_repr("a\tb\r"), "'a\\tb\\r'");
        assert_eq!(py_repr("back\\slash"), "'back\\\\slash'");
        assert_eq!(py_repr("\u{0}"), "'\\x00'");
        assert_eq!(py_repr("\u{7f}"), "'\\x7f'");
        assert_eq!(py_repr("\u{a0}"), "'\\xa0'");
        assert_eq!(py_repr("\u{200b}"), "'\\u200b'");
        assert_eq!(py_repr("\u{feff}"), "'\\ufeff'");
    }

    #[test]
    fn test_py_repr_escapes_format_and_unassigned_code_points() {
        assert_eq!(py_repr("\u{600}"), "'\\u0600'");
        assert_eq!(py_repr("\u{6dd}"), "'\\u06dd'");
        assert_eq!(py_repr("\u{fdd0}"), "'\\ufdd0'");
        assert_eq!(py_repr("\u{378}"), "'\\u0378'");
        assert_eq!(py_repr("\u{e000}"), "'\\ue000'");
        assert_eq!(py_repr("a\u{3000}b"), "'a\\u3000b'");
        assert_eq!(py_repr("\u{110bd}"), "'\\U000110bd'");
    }

    #[test]
    fn test_py_repr_keeps_printable_unicode() {
        assert_eq!(py_repr("é"), "'é'");
        assert_eq!(py_repr("日本"), "'日本'");
        assert_eq!(py_repr("🙂"), "'🙂'");
        assert_eq!(py_repr("\u{fffd}"), "'\u{fffd}'");
    }

    #[test]
    fn test_file_log_round_trip() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.txt");
        {
            let mut log = RunLog::create(&path)?;
            log.write_header("tiny", 1, &ControllerConfig::new(1.0, 0.0, 0.5))?;
            log.write_step(0, 1.5, 0.5, "hi")?;
            log.flush()?;
        }
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(
            text,
            "model_id=tiny\nlayer=1 k=1.0 min=0.0 max=0.5\n\n[t=0] H=1.500 sigma=0.500 token='hi'\n"
        );
        Ok(())
    }
}
