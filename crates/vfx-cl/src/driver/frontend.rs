//! Minimal OpenCL C front-end for the reference device.
//!
//! Strips comments and literals, checks delimiter balance and collects
//! `__kernel void name(` declarations. Diagnostics are rendered in the
//! clang style device compilers use in their build logs.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// One build log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Diagnostic {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<source>:{}:{}: error: {}", self.line, self.col, self.message)
    }
}

/// Kernel entry point found in a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KernelDecl {
    pub name: String,
    pub params: usize,
}

/// Result of scanning a program source.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scan {
    pub kernels: Vec<KernelDecl>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Scan {
    pub fn is_ok(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Build log text.
    pub fn log(&self) -> String {
        if self.diagnostics.is_empty() {
            return String::new();
        }
        let mut log = String::new();
        for diag in &self.diagnostics {
            log.push_str(&diag.to_string());
            log.push('\n');
        }
        let n = self.diagnostics.len();
        log.push_str(&format!("{n} error{} generated.\n", if n == 1 { "" } else { "s" }));
        log
    }
}

fn kernel_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(?:__kernel|kernel)\s+void\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(")
            .expect("kernel declaration pattern")
    })
}

/// Scan `source` for structural errors and kernel declarations.
pub(crate) fn scan(source: &str) -> Scan {
    let mut scan = Scan::default();
    let code = strip(source, &mut scan.diagnostics);
    check_delimiters(&code, &mut scan.diagnostics);

    for caps in kernel_pattern().captures_iter(&code) {
        let (Some(all), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        // First declaration wins.
        if !scan.kernels.iter().any(|k| k.name == name.as_str()) {
            scan.kernels.push(KernelDecl {
                name: name.as_str().to_string(),
                params: count_params(&code[all.end()..]),
            });
        }
    }
    scan
}

/// Count top-level parameters in `rest`, which starts just after the `(`.
fn count_params(rest: &str) -> usize {
    let mut depth = 0usize;
    let mut commas = 0usize;
    let mut end = rest.len();
    for (i, c) in rest.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' if depth == 0 => {
                end = i;
                break;
            }
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => commas += 1,
            _ => {}
        }
    }
    let list = rest[..end].trim();
    if list.is_empty() || list == "void" {
        0
    } else {
        commas + 1
    }
}

/// Replace comments and string/char literals with spaces, keeping newlines.
fn strip(source: &str, diags: &mut Vec<Diagnostic>) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Code,
        Line,
        Block,
        Str(char),
    }

    let mut out = String::with_capacity(source.len());
    let mut mode = Mode::Code;
    let mut opened = (0, 0);
    let (mut line, mut col) = (1usize, 0usize);
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        col += 1;
        let keep = if c == '\n' { '\n' } else { ' ' };
        match mode {
            Mode::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    col += 1;
                    mode = Mode::Line;
                    out.push_str("  ");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    opened = (line, col);
                    col += 1;
                    mode = Mode::Block;
                    out.push_str("  ");
                }
                '"' | '\'' => {
                    opened = (line, col);
                    mode = Mode::Str(c);
                    out.push(' ');
                }
                _ => out.push(c),
            },
            Mode::Line => {
                if c == '\n' {
                    mode = Mode::Code;
                }
                out.push(keep);
            }
            Mode::Block => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    col += 1;
                    mode = Mode::Code;
                    out.push_str("  ");
                } else {
                    out.push(keep);
                }
            }
            Mode::Str(quote) => {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        col += 1;
                        out.push(' ');
                        out.push(if next == '\n' { '\n' } else { ' ' });
                        if next == '\n' {
                            line += 1;
                            col = 0;
                        }
                        continue;
                    }
                } else if c == quote {
                    mode = Mode::Code;
                } else if c == '\n' {
                    diags.push(Diagnostic {
                        line: opened.0,
                        col: opened.1,
                        message: format!("missing terminating {quote} character"),
                    });
                    mode = Mode::Code;
                }
                out.push(keep);
            }
        }
        if c == '\n' {
            line += 1;
            col = 0;
        }
    }

    match mode {
        Mode::Block => diags.push(Diagnostic {
            line: opened.0,
            col: opened.1,
            message: "unterminated /* comment".to_string(),
        }),
        Mode::Str(quote) => diags.push(Diagnostic {
            line: opened.0,
            col: opened.1,
            message: format!("missing terminating {quote} character"),
        }),
        _ => {}
    }
    out
}

fn check_delimiters(code: &str, diags: &mut Vec<Diagnostic>) {
    let mut stack: Vec<(char, usize, usize)> = Vec::new();
    let (mut line, mut col) = (1usize, 0usize);

    for c in code.chars() {
        col += 1;
        match c {
            '(' | '[' | '{' => stack.push((c, line, col)),
            ')' | ']' | '}' => {
                let want = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _, _)) if open == want => {}
                    Some((open, l, cl)) => {
                        diags.push(Diagnostic {
                            line,
                            col,
                            message: format!(
                                "expected '{}' to match '{open}' at {l}:{cl}",
                                closing(open)
                            ),
                        });
                        return;
                    }
                    None => {
                        diags.push(Diagnostic {
                            line,
                            col,
                            message: format!("extraneous closing delimiter '{c}'"),
                        });
                        return;
                    }
                }
            }
            '\n' => {
                line += 1;
                col = 0;
            }
            _ => {}
        }
    }

    if let Some((open, l, cl)) = stack.pop() {
        diags.push(Diagnostic {
            line,
            col: col + 1,
            message: format!("expected '{}' to match '{open}' at {l}:{cl}", closing(open)),
        });
    }
}

fn closing(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_kernel_declarations() {
        let src = r#"
            // __kernel void commented(int a) {}
            __kernel void run(read_only image2d_t src, write_only image2d_t dst) {
                const char* s = "__kernel void in_string(";
            }
            kernel void other(global float* x) { x[0] = 1.0f; }
        "#;
        let scan = scan(src);
        assert!(scan.is_ok(), "{}", scan.log());
        let names: Vec<_> = scan.kernels.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["run", "other"]);
        assert_eq!(scan.kernels[0].params, 2);
        assert_eq!(scan.kernels[1].params, 1);
    }

    #[test]
    fn counts_parameters() {
        assert_eq!(count_params(") {}"), 0);
        assert_eq!(count_params("void) {}"), 0);
        assert_eq!(count_params("int a, float b[4], int2 c) {"), 3);
        assert_eq!(count_params("__attribute__((x)) int a, int b)"), 2);
    }

    #[test]
    fn reports_unclosed_brace_with_position() {
        let src = "__kernel void run(int a) {\n  a = 1;\n";
        let scan = scan(src);
        assert!(!scan.is_ok());
        let log = scan.log();
        assert!(log.contains("expected '}' to match '{' at 1:26"), "{log}");
        assert!(log.ends_with("1 error generated.\n"));
    }

    #[test]
    fn reports_mismatched_delimiter() {
        let scan = scan("__kernel void run(int a] {}");
        assert!(scan.log().contains("expected ')' to match '('"));
    }

    #[test]
    fn reports_unterminated_comment_and_string() {
        assert!(scan("/* open").log().contains("unterminated /* comment"));
        assert!(scan("x = \"abc\n;").log().contains("missing terminating \" character"));
    }
}
