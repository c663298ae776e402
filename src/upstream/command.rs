//! Command line splitting for the supervised process.

use crate::upstream::SupervisorError;

/// Split `command` into words with shell-like quoting, then append `extra_args`.
///
/// Returns the program and its arguments.
pub fn normalize_command(
    command: &str,
    extra_args: &[String],
) -> Result<(String, Vec<String>), SupervisorError> {
    let mut parts = split_command_line(command)?.into_iter();
    let program = parts.next().ok_or(SupervisorError::EmptyCommand)?;

    let mut args: Vec<String> = parts.collect();
    args.extend(extra_args.iter().cloned());
    Ok((program, args))
}

/// Split a command line on unquoted whitespace.
///
/// Single quotes preserve everything literally. Double quotes group words and
/// allow backslash escapes. Outside single quotes a backslash escapes the next
/// character.
pub fn split_command_line(command: &str) -> Result<Vec<String>, SupervisorError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escape = false;

    for ch in command.chars() {
        if escape {
            current.push(ch);
            escape = false;
            continue;
        }

        match ch {
            '\\' if in_single => current.push(ch),
            '\\' => escape = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if escape {
        return Err(SupervisorError::UnterminatedEscape);
    }
    if in_single || in_double {
        return Err(SupervisorError::UnterminatedQuote);
    }
    if !current.is_empty() {
        words.push(current);
    }

    Ok(words)
}
