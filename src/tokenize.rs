//! Command-line tokenizer shared by [`crate::processor`] for spawning steps
//! and for evaluating `if`/`unless` predicates.
//!
//! Quoting rules: inside single quotes characters are literal (no escapes at
//! all); inside double quotes interior whitespace is preserved verbatim and
//! a backslash escapes a following double quote; outside quotes, runs of
//! whitespace separate and collapse.

/// Splits `command` into argv tokens per the rules above.
pub fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_token = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' if chars.peek() == Some(&'"') => {
                            current.push('"');
                            chars.next();
                        }
                        other => current.push(other),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_quotes_preserve_interior_whitespace() {
        assert_eq!(
            tokenize(r#"echo "hello  world""#),
            vec!["echo".to_string(), "hello  world".to_string()]
        );
    }

    #[test]
    fn single_quotes_preserve_interior_whitespace_literally() {
        assert_eq!(
            tokenize("echo 'hello  world'"),
            vec!["echo".to_string(), "hello  world".to_string()]
        );
    }

    #[test]
    fn backslash_escapes_double_quote_inside_double_quotes() {
        assert_eq!(
            tokenize(r#"echo "\"hello  world\"""#),
            vec!["echo".to_string(), "\"hello  world\"".to_string()]
        );
    }

    #[test]
    fn unquoted_whitespace_runs_collapse() {
        assert_eq!(
            tokenize("echo hello  world"),
            vec!["echo".to_string(), "hello".to_string(), "world".to_string()]
        );
    }

    #[test]
    fn plain_command_with_path_argument() {
        assert_eq!(
            tokenize("ls /tmp"),
            vec!["ls".to_string(), "/tmp".to_string()]
        );
    }

    #[test]
    fn single_quotes_do_not_honor_backslash_escapes() {
        assert_eq!(
            tokenize(r"echo 'a\b'"),
            vec!["echo".to_string(), r"a\b".to_string()]
        );
    }
}
