//! Comment stripping for system instructions and tool descriptions.
//!
//! Instructions are often written with annotations meant for their authors
//! only. Anything between `(*` and `*)` is removed before the text reaches a
//! model. Comments nest, `\(*` produces a literal `(*`, and an unmatched
//! opener is kept as ordinary text.

const OPEN: [char; 2] = ['(', '*'];
const CLOSE: [char; 2] = ['*', ')'];
const ESCAPED_OPEN: [char; 3] = ['\\', '(', '*'];

fn starts_at(chars: &[char], at: usize, pattern: &[char]) -> bool {
    chars
        .get(at..at + pattern.len())
        .is_some_and(|window| window == pattern)
}

/// Remove `(* ... *)` comments from `text`, collapsing the spaces around
/// each removed comment to at most one.
pub fn remove_comments(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out: Vec<char> = Vec::with_capacity(chars.len());
    let mut i = 0;

    while i < chars.len() {
        if starts_at(&chars, i, &ESCAPED_OPEN) {
            out.extend_from_slice(&OPEN);
            i += ESCAPED_OPEN.len();
            continue;
        }

        if !starts_at(&chars, i, &OPEN) {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        let space_before = out.last() == Some(&' ');
        let mut depth = 1usize;
        let mut j = i + OPEN.len();
        while j + 1 < chars.len() && depth > 0 {
            if starts_at(&chars, j, &ESCAPED_OPEN) {
                j += ESCAPED_OPEN.len();
            } else if starts_at(&chars, j, &OPEN) {
                depth += 1;
                j += OPEN.len();
            } else if starts_at(&chars, j, &CLOSE) {
                depth -= 1;
                j += CLOSE.len();
            } else {
                j += 1;
            }
        }

        if depth > 0 {
            // unmatched opener stays as text
            out.push(chars[i]);
            i += 1;
            continue;
        }

        let space_after = chars.get(j) == Some(&' ');
        if space_before && space_after {
            if out.last() == Some(&' ') {
                out.pop();
            }
            out.push(' ');
            j += 1;
        } else if space_before || space_after {
            if out.last() != Some(&' ') {
                out.push(' ');
            }
            if space_after {
                j += 1;
            }
        }
        i = j;
    }

    out.into_iter().collect()
}
