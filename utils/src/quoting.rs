use std::fmt::Display;

/// Helper to format an argument vector the way a POSIX shell would parse it.
#[derive(Debug)]
pub struct ShellQuotedArgs<'a, S> {
    args: &'a [S],
}

impl<'a, S: AsRef<str>> Display for ShellQuotedArgs<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            let arg = arg.as_ref();
            if !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| matches!(c, '/' | '.' | '-' | '_' | '=' | ',' | ':') || c.is_alphanumeric())
            {
                f.write_str(arg)?;
                continue;
            }
            let quoted = shlex::try_quote(arg).map_err(|_| std::fmt::Error)?;
            f.write_str(&quoted)?;
        }
        Ok(())
    }
}

impl<'a, S: AsRef<str>> ShellQuotedArgs<'a, S> {
    /// Given an argument list, quote each entry only if needed. Plain
    /// arguments such as paths and `key=value` pairs are passed through.
    pub fn new(args: &'a [S]) -> Self {
        Self { args }
    }
}
