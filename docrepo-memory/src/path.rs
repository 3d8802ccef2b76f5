//! Dotted field paths over BSON documents.

use bson::{Bson, Document};

use docrepo_core::error::{DocumentStoreError, DocumentStoreResult};

/// Every value a path reaches, descending into arrays of documents.
///
/// `tags.name` over `{ tags: [{ name: "a" }, { name: "b" }] }` yields both names.
pub(crate) fn lookup<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut found = Vec::new();

    if let Some(value) = document.get(segments[0]) {
        descend(value, &segments[1..], &mut found);
    }

    found
}

fn descend<'a>(value: &'a Bson, rest: &[&str], found: &mut Vec<&'a Bson>) {
    let Some((segment, rest)) = rest.split_first() else {
        found.push(value);
        return;
    };

    match value {
        Bson::Document(document) => {
            if let Some(next) = document.get(*segment) {
                descend(next, rest, found);
            }
        }
        Bson::Array(items) => match segment.parse::<usize>() {
            Ok(index) => {
                if let Some(next) = items.get(index) {
                    descend(next, rest, found);
                }
            }
            Err(_) => {
                for item in items {
                    if let Bson::Document(document) = item {
                        if let Some(next) = document.get(*segment) {
                            descend(next, rest, found);
                        }
                    }
                }
            }
        },
        _ => {}
    }
}

/// The value at a path without fanning out over arrays.
pub(crate) fn get<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(document) => document.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Mutable access to the value at a path.
pub(crate) fn get_mut<'a>(document: &'a mut Document, path: &str) -> Option<&'a mut Bson> {
    let mut segments = path.split('.');
    let mut current = document.get_mut(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(document) => document.get_mut(segment)?,
            Bson::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Writes `value` at a path, creating intermediate documents.
///
/// # Errors
///
/// Fails when a path segment crosses a scalar or uses a positional operator.
pub(crate) fn set(document: &mut Document, path: &str, value: Bson) -> DocumentStoreResult<()> {
    if path.contains('$') {
        return Err(DocumentStoreError::Backend(format!(
            "positional path {path} is not supported by the in-memory store"
        )));
    }

    match path.split_once('.') {
        None => {
            document.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = document
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            set_in(child, path, rest, value)
        }
    }
}

fn set_in(target: &mut Bson, full: &str, path: &str, value: Bson) -> DocumentStoreResult<()> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };

    match target {
        Bson::Document(document) => match rest {
            None => {
                document.insert(head, value);
                Ok(())
            }
            Some(rest) => {
                let child = document
                    .entry(head.to_string())
                    .or_insert_with(|| Bson::Document(Document::new()));
                set_in(child, full, rest, value)
            }
        },
        Bson::Array(items) => {
            let index = head.parse::<usize>().map_err(|_| {
                DocumentStoreError::Backend(format!("cannot create field {head} in an array element of {full}"))
            })?;
            while items.len() <= index {
                items.push(Bson::Null);
            }
            match rest {
                None => {
                    items[index] = value;
                    Ok(())
                }
                Some(rest) => {
                    if items[index] == Bson::Null {
                        items[index] = Bson::Document(Document::new());
                    }
                    set_in(&mut items[index], full, rest, value)
                }
            }
        }
        other => Err(DocumentStoreError::Backend(format!(
            "cannot create field {head} in element {other} of {full}"
        ))),
    }
}

/// Removes the value at a path, returning it.
pub(crate) fn remove(document: &mut Document, path: &str) -> Option<Bson> {
    match path.rsplit_once('.') {
        None => document.remove(path),
        Some((parent, leaf)) => match get_mut(document, parent)? {
            Bson::Document(parent) => parent.remove(leaf),
            Bson::Array(items) => {
                let index = leaf.parse::<usize>().ok()?;
                let slot = items.get_mut(index)?;
                Some(std::mem::replace(slot, Bson::Null))
            }
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn lookup_fans_out_over_arrays_of_documents() {
        let document = doc! { "tags": [{ "name": "a" }, { "name": "b" }, 3], "profile": { "age": 4 } };

        assert_eq!(lookup(&document, "tags.name"), vec![&Bson::from("a"), &Bson::from("b")]);
        assert_eq!(lookup(&document, "tags.1.name"), vec![&Bson::from("b")]);
        assert_eq!(lookup(&document, "profile.age"), vec![&Bson::Int32(4)]);
        assert!(lookup(&document, "profile.missing").is_empty());
    }

    #[test]
    fn set_creates_intermediate_documents() {
        let mut document = doc! { "a": 1 };

        set(&mut document, "b.c.d", Bson::Int32(2)).unwrap();
        set(&mut document, "a", Bson::Int32(3)).unwrap();

        assert_eq!(document, doc! { "a": 3, "b": { "c": { "d": 2 } } });
        assert!(set(&mut document, "a.x", Bson::Null).is_err());
        assert!(set(&mut document, "items.$[].x", Bson::Null).is_err());
    }

    #[test]
    fn remove_returns_the_removed_value() {
        let mut document = doc! { "a": { "b": 1, "c": 2 } };

        assert_eq!(remove(&mut document, "a.b"), Some(Bson::Int32(1)));
        assert_eq!(remove(&mut document, "a.missing"), None);
        assert_eq!(document, doc! { "a": { "c": 2 } });
    }
}
