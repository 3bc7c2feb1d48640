use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::store::{KeyValueStore, RESTORE_STATE_KEY, get_json, put_json};
use crate::{Error, Result};

/// Where the restore orchestrator currently is. Transitions are decided by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RestorePhase {
    #[default]
    None,
    Pending,
    RestoringDb,
    CalculatingMedia,
    RestoringMedia,
    CancelingMedia,
}

impl RestorePhase {
    pub const ALL: [Self; 6] = [
        Self::None,
        Self::Pending,
        Self::RestoringDb,
        Self::CalculatingMedia,
        Self::RestoringMedia,
        Self::CancelingMedia,
    ];

    pub fn ordinal(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Pending => 1,
            Self::RestoringDb => 2,
            Self::CalculatingMedia => 3,
            Self::RestoringMedia => 4,
            Self::CancelingMedia => 5,
        }
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|p| i64::from(p.ordinal()) == value)
    }

    pub fn in_progress(self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn is_media_restore_operation(self) -> bool {
        matches!(
            self,
            Self::CalculatingMedia | Self::RestoringMedia | Self::CancelingMedia
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::RestoringDb => "restoring_db",
            Self::CalculatingMedia => "calculating_media",
            Self::RestoringMedia => "restoring_media",
            Self::CancelingMedia => "canceling_media",
        }
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestorePhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("unknown restore phase: {s}"),
            })
    }
}

pub fn load_restore_phase(store: &dyn KeyValueStore) -> Result<RestorePhase> {
    let Some(value) = get_json::<i64>(store, RESTORE_STATE_KEY)? else {
        return Ok(RestorePhase::None);
    };
    RestorePhase::from_ordinal(value).ok_or_else(|| Error::FormatMismatch {
        key: RESTORE_STATE_KEY.to_string(),
        value,
    })
}

pub fn save_restore_phase(store: &dyn KeyValueStore, phase: RestorePhase) -> Result<()> {
    put_json(store, RESTORE_STATE_KEY, &phase.ordinal())?;
    debug!(event = "restore.phase_saved", phase = phase.as_str(), "restore.phase_saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKeyValueStore;

    #[test]
    fn flags_match_phase_table() {
        let media: Vec<_> = RestorePhase::ALL
            .into_iter()
            .filter(|p| p.is_media_restore_operation())
            .collect();
        assert_eq!(
            media,
            vec![
                RestorePhase::CalculatingMedia,
                RestorePhase::RestoringMedia,
                RestorePhase::CancelingMedia
            ]
        );
        assert!(!RestorePhase::None.in_progress());
        assert!(RestorePhase::Pending.in_progress());
        assert!(RestorePhase::RestoringDb.in_progress());
    }

    #[test]
    fn persists_as_ordinal() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(load_restore_phase(&store).unwrap(), RestorePhase::None);

        save_restore_phase(&store, RestorePhase::RestoringMedia).unwrap();
        assert_eq!(store.get(RESTORE_STATE_KEY).unwrap(), Some(b"4".to_vec()));
        assert_eq!(load_restore_phase(&store).unwrap(), RestorePhase::RestoringMedia);
    }

    #[test]
    fn unknown_ordinal_is_format_mismatch() {
        let store = InMemoryKeyValueStore::new();
        store.put(RESTORE_STATE_KEY, b"17").unwrap();
        match load_restore_phase(&store) {
            Err(Error::FormatMismatch { key, value }) => {
                assert_eq!(key, RESTORE_STATE_KEY);
                assert_eq!(value, 17);
            }
            other => panic!("expected format mismatch, got {other:?}"),
        }
    }

    #[test]
    fn parses_names() {
        assert_eq!(
            "calculating_media".parse::<RestorePhase>().unwrap(),
            RestorePhase::CalculatingMedia
        );
        assert!("bogus".parse::<RestorePhase>().is_err());
    }
}
