//! Redis-style glob matching (`*`, `?`, `[...]`, `\` escapes).
//!
//! Used by the in-memory store for `KEYS` and by the local tiers so pattern
//! deletion removes the same keys in both places.

/// Returns true when `key` matches the glob `pattern`.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    match_from(&pattern, &key)
}

fn match_from(pattern: &[char], key: &[char]) -> bool {
    let (mut p, mut k) = (0, 0);
    // Backtrack point for the most recent `*`: (pattern index after it, key index).
    let mut star: Option<(usize, usize)> = None;

    while k < key.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    star = Some((p + 1, k));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    k += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(pattern, p, key[k]) {
                        if matched {
                            p = next;
                            k += 1;
                            continue;
                        }
                    } else if key[k] == '[' {
                        p += 1;
                        k += 1;
                        continue;
                    }
                }
                '\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == key[k] {
                        p += 2;
                        k += 1;
                        continue;
                    }
                }
                literal => {
                    if literal == key[k] {
                        p += 1;
                        k += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((after_star, star_k)) => {
                p = after_star;
                k = star_k + 1;
                star = Some((after_star, star_k + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Evaluate the class starting at `pattern[start] == '['` against `c`.
///
/// Returns `(matched, index after the closing bracket)`, or `None` when the
/// class is unterminated and `[` must be treated literally.
fn match_class(pattern: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        let current = pattern[i];
        if current == ']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;

        let (low, consumed) = if current == '\\' && i + 1 < pattern.len() {
            (pattern[i + 1], 2)
        } else {
            (current, 1)
        };

        if pattern.get(i + consumed) == Some(&'-')
            && pattern
                .get(i + consumed + 1)
                .is_some_and(|high| *high != ']')
        {
            let high = pattern[i + consumed + 1];
            let (low, high) = if low <= high { (low, high) } else { (high, low) };
            if (low..=high).contains(&c) {
                matched = true;
            }
            i += consumed + 2;
        } else {
            if low == c {
                matched = true;
            }
            i += consumed;
        }
    }

    None
}
