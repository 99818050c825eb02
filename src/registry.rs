pub const MAX_ENTRIES: usize = 8;
pub const MAX_NAME_LEN: usize = 63;
pub const MAX_COMMENT_LEN: usize = 63;

/// A single config line, terminator excluded, is truncated to this many
/// bytes while parsing and rendering. Sized for long values such as keys.
pub const MAX_LINE_LEN: usize = 2047;

/// Returns `true` when the value bytes are acceptable for the entry.
pub type ValidateFn = Box<dyn Fn(&[u8]) -> bool>;

/// Applies the value bytes to live device state.
pub type UpdateFn = Box<dyn FnMut(&[u8])>;

/// Writes the entry's canonical `name=value` line for the current device
/// state into the buffer and returns the number of bytes written.
pub type PrintFn = Box<dyn Fn(&mut [u8]) -> usize>;

pub struct ConfigEntry {
    name: String,
    comment: String,
    default_value: &'static str,
    validate: Option<ValidateFn>,
    update: Option<UpdateFn>,
    print: Option<PrintFn>,
}

impl ConfigEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stored comment, already formatted as `"\t<text>\r\n"`.
    pub fn comment(&self) -> &[u8] {
        self.comment.as_bytes()
    }

    pub fn default_value(&self) -> &'static str {
        self.default_value
    }

    /// Does `bytes` begin with this entry's name immediately followed by
    /// `'='`?
    pub fn matches_line(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(self.name.as_bytes()) && bytes.get(self.name.len()) == Some(&b'=')
    }

    pub(crate) fn run_validate(&self, value: &[u8]) -> bool {
        self.validate.as_ref().map_or(true, |validate| validate(value))
    }

    pub(crate) fn run_update(&mut self, value: &[u8]) {
        if let Some(update) = self.update.as_mut() {
            update(value);
        }
    }

    pub(crate) fn run_update_with_default(&mut self) {
        let default_value = self.default_value();
        if let Some(update) = self.update.as_mut() {
            update(default_value.as_bytes());
        }
    }

    /// Render the canonical line through the printer, if one is set.
    pub(crate) fn print_line(&self) -> Option<Vec<u8>> {
        self.print.as_ref().map(|print| {
            let mut line = vec![0u8; MAX_LINE_LEN];
            let written = print(&mut line).min(MAX_LINE_LEN);
            line.truncate(written);
            line
        })
    }

    /// `name=default_value`, the line used when the printer is absent or
    /// the host's value was rejected.
    pub(crate) fn default_line(&self) -> Vec<u8> {
        let mut line = format!("{}={}", self.name(), self.default_value()).into_bytes();
        line.truncate(MAX_LINE_LEN);
        line
    }
}

#[derive(Default)]
pub struct EntryRegistry {
    slots: [Option<ConfigEntry>; MAX_ENTRIES],
}

impl EntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next free slot. Slots are handed out in registration
    /// order and never reused; returns `false` once all are taken.
    pub fn register(
        &mut self,
        name: &str,
        default_value: &'static str,
        comment: &str,
        validate: Option<ValidateFn>,
        update: Option<UpdateFn>,
        print: Option<PrintFn>,
    ) -> bool {
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            log::warn!("no free entry slot for {name:?}");
            return false;
        };

        *slot = Some(ConfigEntry {
            name: truncated(name, MAX_NAME_LEN).to_owned(),
            comment: truncated(&format!("\t{comment}\r\n"), MAX_COMMENT_LEN).to_owned(),
            default_value,
            validate,
            update,
            print,
        });
        true
    }

    pub fn occupied(&self) -> impl Iterator<Item = (usize, &ConfigEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|entry| (index, entry)))
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> Option<&mut ConfigEntry> {
        self.slots[index].as_mut()
    }

    /// Do the bytes start with `name=` for any registered entry? This is
    /// the probe deciding whether a byte region holds configuration
    /// content at all.
    pub fn matches_any_entry(&self, bytes: &[u8]) -> bool {
        self.occupied().any(|(_, entry)| entry.matches_line(bytes))
    }
}

fn truncated(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }

    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[test]
fn registration_fills_slots_in_order() {
    let mut registry = EntryRegistry::new();

    for i in 0..MAX_ENTRIES {
        assert!(registry.register(&format!("entry{i}"), "0", "#", None, None, None));
    }
    assert!(!registry.register("overflow", "0", "#", None, None, None));

    let names: Vec<_> = registry.occupied().map(|(_, e)| e.name().to_owned()).collect();
    assert_eq!(names.len(), MAX_ENTRIES);
    assert_eq!(names[0], "entry0");
    assert_eq!(names[7], "entry7");
}

#[test]
fn comment_is_stored_framed() {
    let mut registry = EntryRegistry::new();
    registry.register("brightness", "50", "#(0~100)", None, None, None);

    let (_, entry) = registry.occupied().next().unwrap();
    assert_eq!(entry.comment(), b"\t#(0~100)\r\n");
    assert_eq!(entry.default_line(), b"brightness=50");
}

#[test]
fn long_name_and_comment_truncate() {
    let mut registry = EntryRegistry::new();
    let name = "n".repeat(80);
    registry.register(&name, "1", &"c".repeat(80), None, None, None);

    let (_, entry) = registry.occupied().next().unwrap();
    assert_eq!(entry.name().len(), MAX_NAME_LEN);
    assert_eq!(entry.comment().len(), MAX_COMMENT_LEN);
}

#[test]
fn line_matching() {
    let mut registry = EntryRegistry::new();
    registry.register("speed", "9600", "#baud", None, None, None);

    assert!(registry.matches_any_entry(b"speed=115200"));
    assert!(registry.matches_any_entry(b"speed="));
    assert!(!registry.matches_any_entry(b"speed 9600"));
    assert!(!registry.matches_any_entry(b"speedy=1"));
    assert!(!registry.matches_any_entry(b"spee"));
    assert!(!registry.matches_any_entry(b""));
}

#[test]
fn printer_output_is_bounded() {
    let mut registry = EntryRegistry::new();
    registry.register(
        "blob",
        "",
        "#",
        None,
        None,
        Some(Box::new(|buf: &mut [u8]| {
            buf.fill(b'x');
            buf.len() + 100 // lies about the written length
        })),
    );

    let (_, entry) = registry.occupied().next().unwrap();
    let line = entry.print_line().unwrap();
    assert_eq!(line.len(), MAX_LINE_LEN);
}
