/// Indent unit expected by the wiki's `code:` block syntax.
pub const INDENT: char = '\t';

/// Indent every line of `text` by one unit so it renders inside a code block.
///
/// A terminal newline does not produce an indented empty line. Applying this
/// twice indents twice; callers transform each source body exactly once.
pub fn indent_block(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let newlines = text.matches('\n').count();
    let mut out = String::with_capacity(text.len() + newlines + 1);
    out.push(INDENT);
    for ch in text.chars() {
        out.push(ch);
        if ch == '\n' {
            out.push(INDENT);
        }
    }
    if text.ends_with('\n') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::indent_block;

    #[test]
    fn indents_every_line() {
        assert_eq!(indent_block("a\nb"), "\ta\n\tb");
    }

    #[test]
    fn terminal_newline_leaves_no_dangling_indent() {
        assert_eq!(indent_block("a\nb\n"), "\ta\n\tb\n");
        assert_eq!(indent_block("\n"), "\t\n");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(indent_block(""), "");
    }

    #[test]
    fn blank_lines_are_indented_too() {
        assert_eq!(indent_block("a\n\nb"), "\ta\n\t\n\tb");
    }

    #[test]
    fn applying_twice_double_indents() {
        let once = indent_block("body {}\n");
        let twice = indent_block(&once);
        assert_ne!(once, twice);
        assert_eq!(twice, "\t\tbody {}\n");
    }

    #[test]
    fn trailing_tab_in_source_is_preserved() {
        assert_eq!(indent_block("a\t"), "\ta\t");
    }
}
