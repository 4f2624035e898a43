// SPDX-License-Identifier: GPL-3.0-only

use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use crate::error::{Result, SysError};

/// Default location of the kernel mount table.
pub const DEFAULT_MOUNTINFO: &str = "/proc/self/mountinfo";

/// One row of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Snapshot of the mount table. Re-read for every decision since mounts
/// change underneath us.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn load(path: &Path) -> Result<Self> {
        let mount_info = fs::read_to_string(path)?;
        Self::parse(&mount_info)
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for line in input.lines().filter(|line| !line.trim().is_empty()) {
            let (left, right) = line
                .split_once(" - ")
                .ok_or_else(|| invalid_line(line))?;

            let mount_point = left
                .split_whitespace()
                .nth(4)
                .ok_or_else(|| invalid_line(line))?;

            let mut right_fields = right.split_whitespace();
            let fs_type = right_fields.next().ok_or_else(|| invalid_line(line))?;
            let source = right_fields.next().ok_or_else(|| invalid_line(line))?;

            entries.push(MountEntry {
                source: String::from_utf8_lossy(&unescape_mount_field(source)).into_owned(),
                mount_point: PathBuf::from(OsString::from_vec(unescape_mount_field(mount_point))),
                fs_type: fs_type.to_string(),
            });
        }

        Ok(Self { entries })
    }

    /// Last entry mounted at `mount_point`; later mounts shadow earlier ones.
    pub fn entry_for(&self, mount_point: &Path) -> Option<&MountEntry> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.mount_point == mount_point)
    }

    pub fn is_source_mounted(&self, device: &str) -> bool {
        self.entries.iter().any(|entry| entry.source == device)
    }
}

fn invalid_line(line: &str) -> SysError {
    SysError::Parse(format!("invalid mountinfo line: {line}"))
}

/// Decode the kernel's `\ooo` escapes. The result is raw bytes: paths are
/// not required to be UTF-8.
fn unescape_mount_field(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1..=index + 3].iter().all(|byte| (b'0'..=b'7').contains(byte))
        {
            let octal = &value[index + 1..index + 4];
            if let Ok(num) = u8::from_str_radix(octal, 8) {
                output.push(num);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index]);
        index += 1;
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "36 25 8:2 / / rw,relatime - ext4 /dev/nvme0n1p2 rw\n\
        37 25 0:5 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw\n\
        90 36 0:61 / /var/lib/docker rw,relatime - btrfs /dev/sdb rw,space_cache=v2\n\
        91 36 0:62 / /mnt/with\\040space rw - ext4 /dev/sdc1 rw\n";

    #[test]
    fn parses_source_and_type() {
        let table = MountTable::parse(SAMPLE).expect("parse should succeed");
        assert!(table.entry_for(Path::new("/proc")).is_some());

        let docker = table.entry_for(Path::new("/var/lib/docker")).unwrap();
        assert_eq!(docker.fs_type, "btrfs");
        assert_eq!(docker.source, "/dev/sdb");
    }

    #[test]
    fn unescapes_octal_sequences() {
        let table = MountTable::parse(SAMPLE).unwrap();
        assert!(table.entry_for(Path::new("/mnt/with space")).is_some());
    }

    #[test]
    fn keeps_non_ascii_paths_intact() {
        let table = MountTable::parse(
            "92 36 0:63 / /srv/dépôt rw - btrfs /dev/disk/by-label/été rw\n\
             93 36 0:64 / /srv/café\\040données rw - ext4 /dev/sdd1 rw\n",
        )
        .unwrap();

        let entry = table.entry_for(Path::new("/srv/dépôt")).unwrap();
        assert_eq!(entry.source, "/dev/disk/by-label/été");
        assert!(table.entry_for(Path::new("/srv/café données")).is_some());
        assert!(table.is_source_mounted("/dev/sdd1"));
    }

    #[test]
    fn reports_mounted_sources() {
        let table = MountTable::parse(SAMPLE).unwrap();
        assert!(table.is_source_mounted("/dev/sdc1"));
        assert!(!table.is_source_mounted("/dev/sdd"));
    }

    #[test]
    fn rejects_lines_without_separator() {
        assert!(MountTable::parse("36 25 8:2 / / rw\n").is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mountinfo");
        fs::write(&path, SAMPLE).unwrap();

        let table = MountTable::load(&path).unwrap();
        assert!(table.entry_for(Path::new("/")).is_some());
    }
}
