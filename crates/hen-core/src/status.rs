use std::fmt;

/// Presence of a connected client, as shown by LIST and presence notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Online,
    Away,
    Dnd,
}

impl Status {
    pub const ALL: [Status; 3] = [Status::Online, Status::Away, Status::Dnd];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Online => "ONLINE",
            Status::Away => "AWAY",
            Status::Dnd => "DND",
        }
    }

    /// The status whose literal starts `line`, case-sensitive.
    pub fn from_prefix(line: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| line.starts_with(status.as_str()))
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Status::Online => 0,
            Status::Away => 1,
            Status::Dnd => 2,
        }
    }

    // Unknown values fall back to online; only `as_u8` ever produces input.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Status::Away,
            2 => Status::Dnd,
            _ => Status::Online,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
