//! Alarm tree paths look like `/Accelerator/Vacuum/Pump1`.
//!
//! Names may contain slashes (PV names such as `sim://ramp` do), those
//! are escaped as `\/` inside a path.

const SEPARATOR: char = '/';
const ESCAPE: char = '\\';

/// Split a path into its element names, un-escaping slashes
pub fn split(path: &str) -> Vec<String> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE if chars.peek() == Some(&SEPARATOR) => {
                current.push(SEPARATOR);
                chars.next();
            }
            SEPARATOR => {
                if !current.is_empty() {
                    elements.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        elements.push(current);
    }
    elements
}

fn escape(name: &str) -> String {
    name.replace(SEPARATOR, "\\/")
}

/// Path of `name` below `parent`, or the root path if there is no parent
pub fn make_path(parent: Option<&str>, name: &str) -> String {
    let mut path = parent.unwrap_or("").trim_end_matches(SEPARATOR).to_string();
    path.push(SEPARATOR);
    path.push_str(&escape(name));
    path
}

/// Build a path from element names
pub fn join<S: AsRef<str>>(elements: &[S]) -> String {
    let mut path = String::new();
    for element in elements {
        path.push(SEPARATOR);
        path.push_str(&escape(element.as_ref()));
    }
    path
}

pub fn parent(path: &str) -> Option<String> {
    let elements = split(path);
    if elements.len() < 2 {
        return None;
    }
    Some(join(&elements[..elements.len() - 1]))
}

/// Last element of the path
pub fn name(path: &str) -> String {
    split(path).pop().unwrap_or_default()
}

#[cfg(test)]
use test_log::test;

#[test]
fn test_split_path() {
    assert_eq!(split("/Acc/Vac/pv1"), vec!["Acc", "Vac", "pv1"]);
    assert_eq!(split("Acc/Vac"), vec!["Acc", "Vac"]);
    assert_eq!(split("/Acc/sim:\\/\\/ramp"), vec!["Acc", "sim://ramp"]);
    assert!(split("/").is_empty());
}

#[test]
fn test_make_path() {
    assert_eq!(make_path(None, "Acc"), "/Acc");
    assert_eq!(make_path(Some("/Acc"), "Vac"), "/Acc/Vac");
    let pv = make_path(Some("/Acc/Vac"), "loc://x");
    assert_eq!(pv, "/Acc/Vac/loc:\\/\\/x");
    assert_eq!(name(&pv), "loc://x");
    assert_eq!(parent(&pv).as_deref(), Some("/Acc/Vac"));
    assert_eq!(parent("/Acc"), None);
}
