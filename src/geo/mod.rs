//! Offline IP geolocation
//!
//! Reads the QQWry "czutf8" database file: an 8-byte header holding the
//! index bounds, 7-byte index entries (4-byte little-endian range start +
//! 3-byte record offset) sorted by start address, and records of a 4-byte
//! range end followed by NUL-terminated UTF-8 location strings with
//! 0x01/0x02 redirect bytes.

use crate::error::{PoolError, Result};
use crate::models::GeoInfo;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::info;

const INDEX_ENTRY_LEN: usize = 7;

/// In-memory reader over the location database
pub struct GeoLocator {
    data: Vec<u8>,
    index_first: usize,
    index_count: usize,
}

impl GeoLocator {
    /// Load the database file into memory and validate the index header
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        if data.len() < 8 {
            return Err(PoolError::InvalidConfig(format!(
                "{} is not a location database",
                path.display()
            )));
        }

        let index_first = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let index_last = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;

        if index_first > index_last || index_last + INDEX_ENTRY_LEN > data.len() {
            return Err(PoolError::InvalidConfig(format!(
                "{} has a corrupt index",
                path.display()
            )));
        }

        let index_count = (index_last - index_first) / INDEX_ENTRY_LEN + 1;

        info!(
            path = %path.display(),
            ranges = index_count,
            "Loaded IP location database"
        );

        Ok(GeoLocator {
            data,
            index_first,
            index_count,
        })
    }

    /// Look up the location of an IPv4 address literal.
    ///
    /// Returns `None` for IPv6 addresses and addresses outside every
    /// indexed range.
    pub fn lookup(&self, ip: &str) -> Option<GeoInfo> {
        let addr: Ipv4Addr = ip.parse().ok()?;
        let ip = u32::from(addr);

        let entry = self.find_entry(ip)?;
        let record = self.u24(self.index_first + entry * INDEX_ENTRY_LEN + 4)? as usize;

        let range_end = self.u32(record)?;
        if ip > range_end {
            return None;
        }

        let (location, _area) = self.read_location(record + 4)?;
        Some(split_location(&location))
    }

    /// Rightmost index entry whose range start is <= `ip`
    fn find_entry(&self, ip: u32) -> Option<usize> {
        let mut lo = 0usize;
        let mut hi = self.index_count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let start = self.u32(self.index_first + mid * INDEX_ENTRY_LEN)?;
            if start <= ip {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.checked_sub(1)
    }

    /// Read the location/area string pair at `pos`, following redirects
    fn read_location(&self, pos: usize) -> Option<(String, String)> {
        match self.byte(pos)? {
            // Whole pair stored elsewhere
            0x01 => {
                let jump = self.u24(pos + 1)? as usize;
                self.read_pair(jump)
            }
            _ => self.read_pair(pos),
        }
    }

    fn read_pair(&self, pos: usize) -> Option<(String, String)> {
        let (location, area_pos) = match self.byte(pos)? {
            // Location string stored elsewhere, area follows inline
            0x02 => {
                let jump = self.u24(pos + 1)? as usize;
                (self.cstr(jump)?.0, pos + 4)
            }
            _ => self.cstr(pos)?,
        };

        let area = match self.byte(area_pos)? {
            0x01 | 0x02 => {
                let jump = self.u24(area_pos + 1)? as usize;
                if jump == 0 {
                    String::new()
                } else {
                    self.cstr(jump)?.0
                }
            }
            _ => self.cstr(area_pos)?.0,
        };

        Some((location, area))
    }

    fn byte(&self, pos: usize) -> Option<u8> {
        self.data.get(pos).copied()
    }

    fn u24(&self, pos: usize) -> Option<u32> {
        let bytes = self.data.get(pos..pos + 3)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }

    fn u32(&self, pos: usize) -> Option<u32> {
        let bytes = self.data.get(pos..pos + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// NUL-terminated string at `pos`; returns the string and the
    /// position just past the terminator
    fn cstr(&self, pos: usize) -> Option<(String, usize)> {
        let tail = self.data.get(pos..)?;
        let len = tail.iter().position(|&b| b == 0)?;
        let s = String::from_utf8_lossy(&tail[..len]).into_owned();
        Some((s, pos + len + 1))
    }
}

/// Municipalities whose name doubles as province and city
const MUNICIPALITIES: [&str; 4] = ["北京市", "上海市", "天津市", "重庆市"];

/// Split a raw location string into country / province / city
pub fn split_location(location: &str) -> GeoInfo {
    let location = location.trim();
    if location.is_empty() || location == "未知" {
        return GeoInfo::default();
    }

    let Some(rest) = location.strip_prefix("中国") else {
        return GeoInfo {
            country: Some(location.to_string()),
            province: None,
            city: None,
        };
    };

    for name in MUNICIPALITIES {
        if rest.starts_with(name) {
            return GeoInfo {
                country: Some("中国".to_string()),
                province: Some(name.to_string()),
                city: Some(name.to_string()),
            };
        }
    }

    let (province, tail) = if let Some(i) = rest.find('省') {
        let end = i + '省'.len_utf8();
        (Some(rest[..end].to_string()), &rest[end..])
    } else if let Some(i) = rest.find("自治区") {
        let end = i + "自治区".len();
        (Some(rest[..end].to_string()), &rest[end..])
    } else {
        (None, rest)
    };

    let city = tail
        .find('市')
        .map(|i| tail[..i + '市'.len_utf8()].to_string());

    GeoInfo {
        country: Some("中国".to_string()),
        province,
        city,
    }
}
