//! redb table definitions for the herd state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized types).

use std::fmt;

use redb::TableDefinition;

pub type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Images keyed by image name.
pub const IMAGES: Table = TableDefinition::new("images");

/// Machine database entries keyed by hostname.
pub const MDB: Table = TableDefinition::new("mdb");

/// Herd-wide settings keyed by setting name.
pub const SETTINGS: Table = TableDefinition::new("settings");

/// The kinds of record the store keeps, one table each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Image,
    MdbEntry,
    Settings,
}

impl Record {
    pub const ALL: [Record; 3] = [Record::Image, Record::MdbEntry, Record::Settings];

    pub fn table(self) -> Table {
        match self {
            Record::Image => IMAGES,
            Record::MdbEntry => MDB,
            Record::Settings => SETTINGS,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Record::Image => "image",
            Record::MdbEntry => "mdb entry",
            Record::Settings => "settings",
        })
    }
}
