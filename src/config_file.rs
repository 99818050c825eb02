//! Parsing, validation and rendering of the configuration file content.
//!
//! The on-disk grammar is one entry per line, `NAME=VALUE[\t#COMMENT]`,
//! lines separated by CRLF or LF. Rendering is the inverse: for every
//! registered entry, the canonical `name=value` line followed by the
//! entry's stored comment.

use crate::registry::{EntryRegistry, MAX_ENTRIES, MAX_LINE_LEN};

/// Lines rendered for the registry slots; `None` for empty slots.
pub(crate) type SlotLines = [Option<Vec<u8>>; MAX_ENTRIES];

/// Split the input into up to [`MAX_ENTRIES`] lines on CRLF or LF. A bare
/// CR is content, not a terminator. A NUL byte or the end of the input
/// terminates parsing; each line is truncated to [`MAX_LINE_LEN`] bytes.
pub(crate) fn split_lines(input: &[u8]) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut pos = 0;

    for _ in 0..MAX_ENTRIES {
        let mut line = Vec::new();
        let mut terminated = false;

        loop {
            match input.get(pos) {
                None | Some(0) => break,
                Some(&b'\n') => {
                    pos += 1;
                    terminated = true;
                    break;
                }
                Some(&b'\r') if input.get(pos + 1) == Some(&b'\n') => {
                    pos += 2;
                    terminated = true;
                    break;
                }
                Some(&byte) => {
                    if line.len() < MAX_LINE_LEN {
                        line.push(byte);
                    }
                    pos += 1;
                }
            }
        }

        lines.push(line);
        if !terminated {
            break;
        }
    }

    lines
}

/// Strip the in-band comment: the value runs up to the first `\t#` pair.
pub(crate) fn clean_value(raw: &[u8]) -> &[u8] {
    raw.windows(2)
        .position(|pair| pair == b"\t#")
        .map_or(raw, |at| &raw[..at])
}

/// Run every registered entry against the parsed lines.
///
/// An entry found with an acceptable value is applied through `update`
/// and its canonical line re-rendered from the printer; a rejected or
/// missing entry falls back to its default (a missing one also applies
/// the default through `update`). Returns the `illegal` flag — set when
/// any entry was rejected or missing — and the line to render per slot.
pub(crate) fn process_entries(
    registry: &mut EntryRegistry,
    lines: &[Vec<u8>],
) -> (bool, SlotLines) {
    let mut illegal = false;
    let mut rendered: SlotLines = Default::default();

    for slot in 0..MAX_ENTRIES {
        let Some(entry) = registry.slot_mut(slot) else {
            continue;
        };

        let found = lines.iter().find(|line| entry.matches_line(line));
        match found {
            Some(line) => {
                let value = clean_value(&line[entry.name().len() + 1..]);
                if entry.run_validate(value) {
                    entry.run_update(value);
                    rendered[slot] =
                        Some(entry.print_line().unwrap_or_else(|| entry.default_line()));
                } else {
                    log::debug!("rejected value for {:?}, restoring default", entry.name());
                    rendered[slot] = Some(entry.default_line());
                    illegal = true;
                }
            }
            None => {
                log::debug!("no line for {:?}, applying default", entry.name());
                entry.run_update_with_default();
                rendered[slot] = Some(entry.default_line());
                illegal = true;
            }
        }
    }

    (illegal, rendered)
}

/// Default line for every occupied slot, used when creating a fresh
/// volume.
pub(crate) fn default_lines(registry: &EntryRegistry) -> SlotLines {
    let mut rendered: SlotLines = Default::default();
    for (slot, entry) in registry.occupied() {
        rendered[slot] = Some(entry.default_line());
    }
    rendered
}

/// Concatenate `line + comment` per occupied slot into `out`, in
/// registration order. A slot that would overflow the window is dropped.
/// Returns the number of bytes written.
pub(crate) fn write_file(registry: &EntryRegistry, lines: &SlotLines, out: &mut [u8]) -> usize {
    let mut len = 0;

    for (slot, entry) in registry.occupied() {
        let Some(line) = &lines[slot] else {
            continue;
        };
        let comment = entry.comment();

        if len + line.len() + comment.len() > out.len() {
            log::debug!("dropping {:?}: rendered file exceeds the data window", entry.name());
            continue;
        }

        out[len..len + line.len()].copy_from_slice(line);
        len += line.len();
        out[len..len + comment.len()].copy_from_slice(comment);
        len += comment.len();
    }

    len
}

#[cfg(test)]
fn registry_of(names: &[(&str, &'static str)]) -> EntryRegistry {
    let mut registry = EntryRegistry::new();
    for (name, default_value) in names {
        assert!(registry.register(name, default_value, "#", None, None, None));
    }
    registry
}

#[test]
fn line_splitting() {
    let lines = split_lines(b"a=1\r\nb=2\nc=3");
    assert_eq!(lines, vec![b"a=1".to_vec(), b"b=2".to_vec(), b"c=3".to_vec()]);

    // bare CR stays in the line
    let lines = split_lines(b"a=1\rstill\nb=2\x00trailing");
    assert_eq!(lines, vec![b"a=1\rstill".to_vec(), b"b=2".to_vec()]);

    // NUL right away yields one empty line
    assert_eq!(split_lines(b"\x00"), vec![Vec::<u8>::new()]);
    assert_eq!(split_lines(b""), vec![Vec::<u8>::new()]);
}

#[test]
fn line_splitting_caps_line_count() {
    let input = b"a\nb\nc\nd\ne\nf\ng\nh\ni\nj\n";
    let lines = split_lines(input);
    assert_eq!(lines.len(), MAX_ENTRIES);
    assert_eq!(lines[7], b"h".to_vec());
}

#[test]
fn overlong_line_truncates() {
    let mut input = vec![b'k'; MAX_LINE_LEN];
    input.extend_from_slice(b"\r\nnext=1\r\n");
    let lines = split_lines(&input);
    assert_eq!(lines[0].len(), MAX_LINE_LEN);
    assert_eq!(lines[1], b"next=1".to_vec());

    // one byte over: the final byte is lost, the following line survives
    let mut input = vec![b'k'; MAX_LINE_LEN + 1];
    input.extend_from_slice(b"\r\nnext=1\r\n");
    let lines = split_lines(&input);
    assert_eq!(lines[0].len(), MAX_LINE_LEN);
    assert_eq!(lines[1], b"next=1".to_vec());
}

#[test]
fn comment_stripping() {
    assert_eq!(clean_value(b"75\t#(0~100)"), b"75");
    assert_eq!(clean_value(b"75"), b"75");
    assert_eq!(clean_value(b"with\ttab#nohash"), b"with\ttab#nohash");
    assert_eq!(clean_value(b"\t#all comment"), b"");
    assert_eq!(clean_value(b""), b"");
}

#[test]
fn missing_entry_applies_default() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
    let sink = seen.clone();

    let mut registry = EntryRegistry::new();
    registry.register(
        "speed",
        "9600",
        "#baud",
        None,
        Some(Box::new(move |value: &[u8]| sink.borrow_mut().push(value.to_vec()))),
        None,
    );

    let (illegal, rendered) = process_entries(&mut registry, &split_lines(b"other=1\r\n"));
    assert!(illegal);
    assert_eq!(rendered[0].as_deref(), Some(b"speed=9600".as_slice()));
    assert_eq!(seen.borrow().as_slice(), &[b"9600".to_vec()]);
}

#[test]
fn rejected_value_restores_default() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
    let sink = seen.clone();

    let mut registry = EntryRegistry::new();
    registry.register(
        "speed",
        "9600",
        "#baud",
        Some(Box::new(|value: &[u8]| value == b"115200")),
        Some(Box::new(move |value: &[u8]| sink.borrow_mut().push(value.to_vec()))),
        None,
    );

    let (illegal, rendered) = process_entries(&mut registry, &split_lines(b"speed=2400\r\n"));
    assert!(illegal);
    assert_eq!(rendered[0].as_deref(), Some(b"speed=9600".as_slice()));
    assert!(seen.borrow().is_empty()); // update never ran

    let (illegal, _) = process_entries(&mut registry, &split_lines(b"speed=115200\t#baud\r\n"));
    assert!(!illegal);
    assert_eq!(seen.borrow().as_slice(), &[b"115200".to_vec()]);
}

#[test]
fn accepted_value_renders_through_printer() {
    let mut registry = EntryRegistry::new();
    registry.register(
        "mode",
        "auto",
        "#",
        None,
        None,
        Some(Box::new(|buf: &mut [u8]| {
            buf[..9].copy_from_slice(b"mode=fast");
            9
        })),
    );

    let (illegal, rendered) = process_entries(&mut registry, &split_lines(b"mode=fast\r\n"));
    assert!(!illegal);
    assert_eq!(rendered[0].as_deref(), Some(b"mode=fast".as_slice()));
}

#[test]
fn file_assembly_and_overflow_drop() {
    let registry = registry_of(&[("a", "1"), ("bee", "22")]);
    let lines = default_lines(&registry);

    let mut out = [0u8; 64];
    let len = write_file(&registry, &lines, &mut out);
    assert_eq!(&out[..len], b"a=1\t#\r\nbee=22\t#\r\n");

    // an exactly-sized window renders without loss
    let mut out = [0u8; 17];
    let len = write_file(&registry, &lines, &mut out);
    assert_eq!(&out[..len], b"a=1\t#\r\nbee=22\t#\r\n");

    // one byte short: the overflowing slot is dropped, not split
    let mut out = [0u8; 16];
    let len = write_file(&registry, &lines, &mut out);
    assert_eq!(&out[..len], b"a=1\t#\r\n");
}
