use super::{build_command, describe_command};
use crate::config::BtrfsConfig;
use crate::error::CollectorError;
use crate::events::DeviceStats;
use log::{debug, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Everything the stats poller needs to know about the filesystems
///
/// Every call is synchronous and may be slow; failures are reported per call
/// so one bad mount or group does not hide the others.
#[cfg_attr(test, mockall::automock)]
pub trait BtrfsSource: Send + Sync {
    /// Mount points currently mounted as btrfs
    fn discover_mounts(&self) -> Result<Vec<PathBuf>, CollectorError>;

    /// Per-device error counters of one mount point
    fn device_stats(&self, mount: &Path) -> Result<Vec<DeviceStats>, CollectorError>;

    /// Filesystem UUIDs known to the kernel
    fn list_groups(&self) -> Result<Vec<String>, CollectorError>;

    /// Whether any member device of the filesystem is flagged missing
    fn group_missing(&self, uuid: &str) -> Result<bool, CollectorError>;
}

/// `BtrfsSource` backed by the btrfs tool, sysfs and the mount table
#[derive(Debug, Clone)]
pub struct SystemBtrfs {
    binary: String,
    use_sudo: bool,
    sysfs_root: PathBuf,
    mounts_file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct DeviceStatsReport {
    #[serde(rename = "device-stats")]
    device_stats: Vec<DeviceStats>,
}

impl SystemBtrfs {
    pub fn from_config(config: &BtrfsConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            use_sudo: config.use_sudo,
            sysfs_root: config.sysfs_root.clone(),
            mounts_file: config.mounts_file.clone(),
        }
    }
}

impl BtrfsSource for SystemBtrfs {
    fn discover_mounts(&self) -> Result<Vec<PathBuf>, CollectorError> {
        let table = fs::read_to_string(&self.mounts_file)?;
        Ok(parse_mount_table(&table))
    }

    fn device_stats(&self, mount: &Path) -> Result<Vec<DeviceStats>, CollectorError> {
        let mut command = build_command(
            &self.binary,
            ["--format", "json", "device", "stats"],
            self.use_sudo,
        );
        command.arg(mount);
        let description = describe_command(&command);
        debug!("Running {}", description);

        let output = command
            .output()
            .map_err(|e| CollectorError::SubprocessSpawn(format!("{}: {}", description, e)))?;

        if !output.status.success() {
            return Err(CollectorError::CommandFailed {
                command: description,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_device_stats(&String::from_utf8_lossy(&output.stdout))
    }

    fn list_groups(&self) -> Result<Vec<String>, CollectorError> {
        let mut groups = Vec::new();
        for entry in fs::read_dir(&self.sysfs_root)? {
            let entry = entry?;
            if entry.path().join("devinfo").is_dir() {
                groups.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        groups.sort();
        Ok(groups)
    }

    fn group_missing(&self, uuid: &str) -> Result<bool, CollectorError> {
        let devinfo = self.sysfs_root.join(uuid).join("devinfo");
        let mut any_missing = false;

        for entry in fs::read_dir(&devinfo)? {
            let entry = entry?;
            let flag = entry.path().join("missing");
            let text = match fs::read_to_string(&flag) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if text.trim() == "1" {
                warn!(
                    "Device {} of filesystem {} is missing",
                    entry.file_name().to_string_lossy(),
                    uuid
                );
                any_missing = true;
            }
        }

        Ok(any_missing)
    }
}

/// Parse `btrfs --format json device stats` output
pub fn parse_device_stats(json: &str) -> Result<Vec<DeviceStats>, CollectorError> {
    let report: DeviceStatsReport = serde_json::from_str(json)
        .map_err(|e| CollectorError::ParseError(format!("device stats: {}", e)))?;
    if report.device_stats.is_empty() {
        return Err(CollectorError::ParseError(
            "device stats: no devices reported".to_string(),
        ));
    }
    Ok(report.device_stats)
}

/// Btrfs mount points of a `/proc/self/mounts` style table, first seen first
pub fn parse_mount_table(table: &str) -> Vec<PathBuf> {
    let mut mounts: Vec<PathBuf> = Vec::new();
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_device), Some(mount), Some(fstype)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if fstype != "btrfs" {
            continue;
        }
        let mount = PathBuf::from(unescape_mount_field(mount));
        if !mounts.contains(&mount) {
            mounts.push(mount);
        }
    }
    mounts
}

// The kernel writes space, tab, newline and backslash as three-digit octal escapes.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                decoded.push(byte);
                i += 4;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STATS_JSON: &str = r#"{
        "__header": {"version": "1"},
        "device-stats": [
            {"device": "/dev/sda1", "devid": "1", "write_io_errs": "2", "read_io_errs": "0",
             "flush_io_errs": "0", "corruption_errs": "1", "generation_errs": "0"},
            {"device": "/dev/sdb1", "devid": 2, "write_io_errs": 0, "read_io_errs": 3,
             "flush_io_errs": 0, "corruption_errs": 0, "generation_errs": 0}
        ]
    }"#;

    fn source(root: &Path) -> SystemBtrfs {
        SystemBtrfs {
            binary: "btrfs".to_string(),
            use_sudo: false,
            sysfs_root: root.join("sys"),
            mounts_file: root.join("mounts"),
        }
    }

    fn add_device(root: &Path, uuid: &str, devid: &str, missing: Option<&str>) {
        let dir = root.join("sys").join(uuid).join("devinfo").join(devid);
        fs::create_dir_all(&dir).unwrap();
        if let Some(flag) = missing {
            fs::write(dir.join("missing"), flag).unwrap();
        }
    }

    #[test]
    fn test_parse_device_stats_mixed_counter_types() {
        let stats = parse_device_stats(STATS_JSON).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].device, "/dev/sda1");
        assert_eq!(stats[0].total_errors(), 3);
        assert_eq!(crate::events::aggregate_errors(&stats), 6);
    }

    #[test]
    fn test_parse_device_stats_rejects_malformed_output() {
        assert!(matches!(
            parse_device_stats("not json"),
            Err(CollectorError::ParseError(_))
        ));
        assert!(matches!(
            parse_device_stats(r#"{"something-else": []}"#),
            Err(CollectorError::ParseError(_))
        ));
        assert!(matches!(
            parse_device_stats(r#"{"device-stats": []}"#),
            Err(CollectorError::ParseError(_))
        ));
        assert!(matches!(
            parse_device_stats(r#"{"device-stats": [{"device": "/dev/sda1", "write_io_errs": "many"}]}"#),
            Err(CollectorError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_mount_table() {
        let table = "\
/dev/sda1 / btrfs rw,relatime,subvol=/@ 0 0
proc /proc proc rw,nosuid 0 0
/dev/sda1 /home btrfs rw,relatime,subvol=/@home 0 0
/dev/sdb1 /mnt/backup\\040disk btrfs rw 0 0
/dev/sda1 / btrfs rw,relatime 0 0
tmpfs /tmp tmpfs rw 0 0

garbage
";
        assert_eq!(
            parse_mount_table(table),
            vec![
                PathBuf::from("/"),
                PathBuf::from("/home"),
                PathBuf::from("/mnt/backup disk"),
            ]
        );
    }

    #[test]
    fn test_unescape_mount_field() {
        assert_eq!(unescape_mount_field("/a\\040b\\011c"), "/a b\tc");
        assert_eq!(unescape_mount_field("/back\\134slash"), "/back\\slash");
        // Not an escape: left as is
        assert_eq!(unescape_mount_field("/odd\\9x"), "/odd\\9x");
        assert_eq!(unescape_mount_field("/tail\\04"), "/tail\\04");
    }

    #[test]
    fn test_discover_mounts_reads_table() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("mounts"),
            "/dev/sda1 /data btrfs rw 0 0\n/dev/sdb1 /boot ext4 rw 0 0\n",
        )
        .unwrap();

        let mounts = source(dir.path()).discover_mounts().unwrap();
        assert_eq!(mounts, vec![PathBuf::from("/data")]);
    }

    #[test]
    fn test_discover_mounts_missing_table_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            source(dir.path()).discover_mounts(),
            Err(CollectorError::IoError(_))
        ));
    }

    #[test]
    fn test_list_groups_requires_devinfo() {
        let dir = TempDir::new().unwrap();
        add_device(dir.path(), "b-uuid", "1", Some("0"));
        add_device(dir.path(), "a-uuid", "1", Some("0"));
        fs::create_dir_all(dir.path().join("sys").join("features")).unwrap();
        fs::write(dir.path().join("sys").join("not-a-dir"), "x").unwrap();

        let groups = source(dir.path()).list_groups().unwrap();
        assert_eq!(groups, vec!["a-uuid".to_string(), "b-uuid".to_string()]);
    }

    #[test]
    fn test_group_missing_aggregates_members() {
        let dir = TempDir::new().unwrap();
        add_device(dir.path(), "healthy", "1", Some("0\n"));
        add_device(dir.path(), "healthy", "2", None);
        add_device(dir.path(), "degraded", "1", Some("0\n"));
        add_device(dir.path(), "degraded", "2", Some("1\n"));

        let btrfs = source(dir.path());
        assert!(!btrfs.group_missing("healthy").unwrap());
        assert!(btrfs.group_missing("degraded").unwrap());
        assert!(btrfs.group_missing("vanished").is_err());
    }

    #[test]
    fn test_device_stats_command_failure() {
        let dir = TempDir::new().unwrap();
        let btrfs = SystemBtrfs {
            binary: "false".to_string(),
            ..source(dir.path())
        };

        match btrfs.device_stats(Path::new("/")) {
            Err(CollectorError::CommandFailed { command, .. }) => {
                assert_eq!(command, "false --format json device stats /");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_device_stats_missing_binary() {
        let dir = TempDir::new().unwrap();
        let btrfs = SystemBtrfs {
            binary: "/nonexistent/btrfs".to_string(),
            ..source(dir.path())
        };
        assert!(matches!(
            btrfs.device_stats(Path::new("/")),
            Err(CollectorError::SubprocessSpawn(_))
        ));
    }
}
