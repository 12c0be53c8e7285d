use std::fmt;

/// Lines the relay writes to clients.
///
/// Every variant renders to a single line without its terminator; the
/// session writer appends the newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Joined { name: String },
    Chat { name: String, text: String },
    Left { name: String },
}

impl Notice {
    pub fn joined(name: impl Into<String>) -> Self {
        Self::Joined { name: name.into() }
    }

    pub fn chat(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Chat {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn left(name: impl Into<String>) -> Self {
        Self::Left { name: name.into() }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Joined { name } => write!(f, "{name} has joined the chat"),
            Notice::Chat { name, text } => write!(f, "[{name}]: {text}"),
            Notice::Left { name } => write!(f, "{name} has left the chat"),
        }
    }
}

/// Normalizes the first line of a connection into a display name.
///
/// A connection that closes before sending anything and one that sends a
/// blank line both end up with the empty name.
pub fn display_name(first_line: Option<&str>) -> String {
    first_line.map(str::trim).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_render_wire_lines() {
        assert_eq!(Notice::joined("alice").to_string(), "alice has joined the chat");
        assert_eq!(Notice::chat("alice", "hello").to_string(), "[alice]: hello");
        assert_eq!(Notice::left("bob").to_string(), "bob has left the chat");
    }

    #[test]
    fn chat_text_is_relayed_verbatim() {
        assert_eq!(Notice::chat("carol", "  spaced  ").to_string(), "[carol]:   spaced  ");
        assert_eq!(Notice::chat("carol", "").to_string(), "[carol]: ");
    }

    #[test]
    fn absent_and_blank_names_are_empty() {
        assert_eq!(display_name(None), "");
        assert_eq!(display_name(Some("   ")), "");
        assert_eq!(display_name(Some("  dave \t")), "dave");
    }
}
