//! Process memory-map enumeration.
//!
//! Parses `/proc/self/maps` lines of the form
//! `00400000-0063c000 r-xp 00000000 fe:01 675628  /usr/bin/vim`
//! into `{range, permission, name}` tuples.

use std::fs::File;
use std::io::{BufRead, BufReader};

use tracing::debug;
use weft_range::Range;

pub const PF_NONE: u8 = 0;
pub const PF_READ: u8 = 1;
pub const PF_WRITE: u8 = 2;
pub const PF_EXEC: u8 = 4;

/// One mapping of the current process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryMap {
    pub range: Range<u64>,
    pub permission: u8,
    pub name: String,
}

impl MemoryMap {
    pub fn is_executable(&self) -> bool {
        self.permission & PF_EXEC != 0
    }

    pub fn is_readable(&self) -> bool {
        self.permission & PF_READ != 0
    }
}

/// Enumerate the current process's mappings.
pub fn current_process_maps(full_path: bool) -> std::io::Result<Vec<MemoryMap>> {
    let file = File::open("/proc/self/maps")?;
    let reader = BufReader::new(file);
    let mut maps = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Some(map) = parse_maps_line(&line, full_path) {
            maps.push(map);
        }
    }
    debug!(count = maps.len(), "process maps enumerated");
    Ok(maps)
}

fn parse_maps_line(line: &str, full_path: bool) -> Option<MemoryMap> {
    let mut fields = line.split_whitespace();

    let range_str = fields.next()?;
    let (start_str, end_str) = range_str.split_once('-')?;
    let start = u64::from_str_radix(start_str, 16).ok()?;
    let end = u64::from_str_radix(end_str, 16).ok()?;

    let perms = fields.next()?.as_bytes();
    let mut permission = PF_NONE;
    if perms.first() == Some(&b'r') {
        permission |= PF_READ;
    }
    if perms.get(1) == Some(&b'w') {
        permission |= PF_WRITE;
    }
    if perms.get(2) == Some(&b'x') {
        permission |= PF_EXEC;
    }

    // Skip offset, device and inode.
    fields.next()?;
    fields.next()?;
    fields.next()?;

    let path = fields.next().unwrap_or("");
    let name = if full_path {
        path.to_string()
    } else {
        path.rsplit('/').next().unwrap_or("").to_string()
    };

    Some(MemoryMap {
        range: Range::new(start, end),
        permission,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_with_path() {
        let line = "00400000-0063c000 r-xp 00000000 fe:01 675628    /usr/bin/vim";
        let map = parse_maps_line(line, true).unwrap();
        assert_eq!(map.range, Range::new(0x400000, 0x63c000));
        assert_eq!(map.permission, PF_READ | PF_EXEC);
        assert_eq!(map.name, "/usr/bin/vim");

        let short = parse_maps_line(line, false).unwrap();
        assert_eq!(short.name, "vim");
    }

    #[test]
    fn test_parse_anonymous_mapping() {
        let line = "7f1234560000-7f1234580000 rw-p 00000000 00:00 0";
        let map = parse_maps_line(line, false).unwrap();
        assert_eq!(map.permission, PF_READ | PF_WRITE);
        assert_eq!(map.name, "");
        assert!(!map.is_executable());
    }

    #[test]
    fn test_parse_special_mapping() {
        let line = "7ffd7af9e000-7ffd7afbf000 rw-p 00000000 00:00 0    [stack]";
        let map = parse_maps_line(line, false).unwrap();
        assert_eq!(map.name, "[stack]");
    }

    #[test]
    fn test_parse_garbage_returns_none() {
        assert_eq!(parse_maps_line("", false), None);
        assert_eq!(parse_maps_line("not a maps line", false), None);
    }

    #[test]
    fn test_current_process_maps_contains_our_code() {
        let maps = current_process_maps(false).expect("maps");
        assert!(!maps.is_empty());
        // This function's code must live in some executable mapping.
        let here = test_current_process_maps_contains_our_code as usize as u64;
        assert!(maps
            .iter()
            .any(|m| m.is_executable() && m.range.contains(here)));
    }
}
