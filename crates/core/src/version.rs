//! Dotted version ordering used to gate every install decision.
//!
//! `compare` is total: malformed input never panics and degrades to
//! `Ordering::Equal` when the two strings cannot be ordered.

use std::cmp::Ordering;

pub fn compare(a: &str, b: &str) -> Ordering {
    let left = tokens(a);
    let right = tokens(b);

    if left.iter().all(|t| is_numeric(t)) && right.iter().all(|t| is_numeric(t)) {
        return compare_numeric_tokens(&left, &right);
    }

    compare_mixed_tokens(&left, &right)
}

pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}

fn tokens(value: &str) -> Vec<&str> {
    value.trim().split('.').map(str::trim).collect()
}

fn is_numeric(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

fn compare_numeric_tokens(left: &[&str], right: &[&str]) -> Ordering {
    let len = left.len().max(right.len());
    for idx in 0..len {
        let l = left.get(idx).copied().unwrap_or("0");
        let r = right.get(idx).copied().unwrap_or("0");
        match compare_digits(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

// Tokens that are identical are skipped, numeric pairs decide, and any other
// differing pair makes the whole comparison ambiguous.
fn compare_mixed_tokens(left: &[&str], right: &[&str]) -> Ordering {
    let len = left.len().max(right.len());
    for idx in 0..len {
        let l = left.get(idx).copied().unwrap_or("0");
        let r = right.get(idx).copied().unwrap_or("0");
        if l == r {
            continue;
        }
        if is_numeric(l) && is_numeric(r) {
            match compare_digits(l, r) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        return Ordering::Equal;
    }
    Ordering::Equal
}

// Arbitrary-length digit strings, so "99999999999999999999" never overflows.
fn compare_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
