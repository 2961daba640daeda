// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identity of a single upgrade run, and the directory names derived from it

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeZone};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier minted once per upgrade run.
///
/// It is embedded into every temporary and archived directory name so that
/// concurrent or historical runs never collide. Renders as 11 characters of
/// URL-safe base64.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct UpgradeId(pub u64);

impl UpgradeId {
    pub fn new_random() -> Self {
        UpgradeId(rand::random())
    }
}

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0.to_be_bytes()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid upgrade id {input:?}")]
pub struct ParseUpgradeIdError {
    input: String,
}

impl FromStr for UpgradeId {
    type Err = ParseUpgradeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseUpgradeIdError { input: s.to_string() };
        let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|_| err())?;
        let bytes: [u8; 8] = bytes.try_into().map_err(|_| err())?;
        Ok(UpgradeId(u64::from_be_bytes(bytes)))
    }
}

/// Returns the name of the temporary data directory used for the target
/// cluster's copy of `datadir`.
///
/// A segment directory named `<prefix><content>` becomes
/// `<prefix>.<id>.<content>` next to the original; anything else (e.g. a
/// standby directory) simply gets `.<id>` appended.
pub fn temp_data_dir(
    datadir: &Utf8Path,
    segment_prefix: &str,
    id: UpgradeId,
) -> Utf8PathBuf {
    let parent = datadir.parent().unwrap_or_else(|| Utf8Path::new(""));
    let Some(name) = datadir.file_name() else {
        return Utf8PathBuf::from(format!("{datadir}.{id}"));
    };

    let content = name
        .strip_prefix(segment_prefix)
        .filter(|rest| rest.parse::<i32>().is_ok());
    match content {
        Some(content) => parent.join(format!("{segment_prefix}.{id}.{content}")),
        None => parent.join(format!("{name}.{id}")),
    }
}

/// Returns the name under which a run's log directory is archived.
pub fn archive_directory_name<Tz>(id: UpgradeId, stamp: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    format!("upgrade-{}-{}", id, stamp.format("%Y-%m-%dT%H:%M"))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Local;

    #[test]
    fn test_zero_id_renders_fixed_width() {
        let id = UpgradeId::default();
        assert_eq!(id.to_string(), "AAAAAAAAAAA");
    }

    #[test]
    fn test_random_id_parses_back() {
        let id = UpgradeId::new_random();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 11);
        assert_eq!(rendered.parse::<UpgradeId>().unwrap(), id);
        assert!("not-an-id".parse::<UpgradeId>().is_err());
    }

    #[test]
    fn test_temp_data_dir() {
        let id = UpgradeId::default();
        let cases = [
            ("/data/seg-1", "seg", "/data/seg.{}.-1"),
            ("/data/master/gpseg-1", "gpseg", "/data/master/gpseg.{}.-1"),
            ("/data/seg1", "seg", "/data/seg.{}.1"),
            ("/data/seg1/", "seg", "/data/seg.{}.1"),
            ("/data/primary/seg3", "seg", "/data/primary/seg.{}.3"),
            ("/data/standby", "seg", "/data/standby.{}"),
            ("/data/segfoo", "seg", "/data/segfoo.{}"),
        ];

        for (datadir, prefix, expected) in cases {
            let actual = temp_data_dir(Utf8Path::new(datadir), prefix, id);
            let expected = expected.replace("{}", &id.to_string());
            assert_eq!(
                actual.as_str(),
                expected,
                "temp_data_dir({datadir:?}, {prefix:?})"
            );
        }
    }

    #[test]
    fn test_archive_directory_name() {
        // Every part of the date is distinct, to catch formatting mistakes
        // such as seconds in place of minutes.
        let stamp = Local.with_ymd_and_hms(2000, 3, 14, 12, 15, 45).unwrap();
        let id = UpgradeId::default();
        assert_eq!(
            archive_directory_name(id, &stamp),
            format!("upgrade-{id}-2000-03-14T12:15")
        );
    }
}
