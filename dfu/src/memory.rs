use std::{cmp, fmt, sync::LazyLock};

use regex::Regex;

use crate::error::ParseError;

static SEGMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s*\*\s*(\d+)\s*([BKM]?)\s*([a-g])$").unwrap()
});

/// DfuSe memory layout, as advertised in the alternate setting's string
/// descriptor.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DfuMemory {
    pub name: String,
    /// Non-overlapping, ascending by start address
    pub segments: Vec<DfuMemSegment>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DfuMemSegment {
    start_addr: u32,
    end_addr: u32,
    page_size: u32,
    mem_type: u8,
}

impl DfuMemory {
    pub fn segment_at(&self, addr: u32) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    /// Lowest-address segment that can be written to
    pub fn first_writable_segment(&self) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.writable())
    }

    /// Number of contiguous readable bytes starting at `addr`
    pub fn max_readable_run(&self, addr: u32) -> u32 {
        self.contiguous_run(addr, DfuMemSegment::readable)
    }

    /// Number of contiguous writable bytes starting at `addr`
    pub fn max_writable_run(&self, addr: u32) -> u32 {
        self.contiguous_run(addr, DfuMemSegment::writable)
    }

    fn contiguous_run(
        &self,
        addr: u32,
        allowed: impl Fn(&DfuMemSegment) -> bool,
    ) -> u32 {
        let mut run: u32 = 0;
        for segment in &self.segments {
            if segment.contains(addr) {
                if !allowed(segment) {
                    return 0;
                }
                run = segment.end_addr - addr;
            } else if run > 0 && segment.start_addr == addr + run {
                if !allowed(segment) {
                    break;
                }
                run += segment.size();
            }
        }
        run
    }

    /// Start addresses of every erasable page overlapping
    /// `[start_addr, start_addr + length)`
    pub fn erase_pages(&self, start_addr: u32, length: u32) -> Vec<u32> {
        let end = start_addr as u64 + length as u64;
        let mut pages = Vec::new();
        for segment in &self.segments {
            let seg_start = segment.start_addr as u64;
            let seg_end = segment.end_addr as u64;
            if !segment.erasable()
                || segment.page_size == 0
                || seg_start >= end
                || seg_end <= start_addr as u64
            {
                continue;
            }
            let page_size = segment.page_size as u64;
            let first = cmp::max(start_addr as u64, seg_start);
            let mut page =
                seg_start + (first - seg_start) / page_size * page_size;
            while page < cmp::min(end, seg_end) {
                pages.push(page as u32);
                page += page_size;
            }
        }
        pages
    }

    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.size() as u64).sum()
    }
}

impl fmt::Display for DfuMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Selected memory region: {} ({})",
            self.name,
            nice_size(self.total_size())
        )?;
        for segment in &self.segments {
            write!(f, "\n{segment}")?;
        }
        Ok(())
    }
}

impl DfuMemSegment {
    pub fn start_addr(&self) -> u32 {
        self.start_addr
    }
    /// Exclusive
    pub fn end_addr(&self) -> u32 {
        self.end_addr
    }
    pub fn page_size(&self) -> u32 {
        self.page_size
    }
    pub fn size(&self) -> u32 {
        self.end_addr - self.start_addr
    }
    pub fn pages(&self) -> u32 {
        if self.page_size == 0 {
            0
        } else {
            self.size() / self.page_size
        }
    }
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start_addr && addr < self.end_addr
    }
    pub fn readable(&self) -> bool {
        self.mem_type & 1 == 1
    }
    pub fn erasable(&self) -> bool {
        self.mem_type & 2 == 2
    }
    pub fn writable(&self) -> bool {
        self.mem_type & 4 == 4
    }
}

impl fmt::Display for DfuMemSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut properties = Vec::new();
        if self.readable() {
            properties.push("readable");
        }
        if self.erasable() {
            properties.push("erasable");
        }
        if self.writable() {
            properties.push("writable");
        }
        write!(
            f,
            "0x{:08x}-0x{:08x} ({})",
            self.start_addr,
            self.end_addr.wrapping_sub(1),
            if properties.is_empty() {
                "inaccessible".to_string()
            } else {
                properties.join(", ")
            }
        )
    }
}

pub(crate) fn nice_size(n: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    let fmt_div = |unit: u64, suffix: &str| {
        if n % unit == 0 {
            format!("{}{suffix}", n / unit)
        } else {
            format!("{:.2}{suffix}", n as f64 / unit as f64)
        }
    };
    if n >= GIB {
        fmt_div(GIB, "GiB")
    } else if n >= MIB {
        fmt_div(MIB, "MiB")
    } else if n >= KIB {
        fmt_div(KIB, "KiB")
    } else {
        format!("{n}B")
    }
}

/// Parse a DfuSe memory layout string
/// (ex: `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`).
///
/// Several `/0xADDR/segments` groups may follow the name. A layout
/// without any segment is valid.
pub fn parse_memory_layout(
    mem_layout_str: &str,
) -> Result<DfuMemory, ParseError> {
    let not_a_layout =
        || ParseError::NotAMemoryLayout(mem_layout_str.to_string());

    let layout = mem_layout_str.strip_prefix('@').ok_or_else(not_a_layout)?;
    let name_end = layout.find('/').ok_or_else(not_a_layout)?;
    let name = layout[..name_end].trim().to_string();

    let groups = layout[name_end + 1..].trim();
    let mut segments = Vec::new();
    if !groups.is_empty() {
        let tokens: Vec<&str> = groups.split('/').collect();
        if tokens.len() % 2 != 0 {
            return Err(not_a_layout());
        }
        for group in tokens.chunks(2) {
            let mut addr = parse_address(group[0])?;
            for token in group[1].split(',').map(str::trim) {
                if token.is_empty() {
                    continue;
                }
                let segment = parse_segment(token, addr)?;
                addr = segment.end_addr;
                segments.push(segment);
            }
        }
    }

    segments.sort_by_key(|s| s.start_addr);
    let overlap = segments
        .windows(2)
        .find(|w| w[1].start_addr < w[0].end_addr);
    if let Some(w) = overlap {
        return Err(ParseError::OverlappingSegments {
            address: w[1].start_addr,
        });
    }

    Ok(DfuMemory { name, segments })
}

fn parse_address(token: &str) -> Result<u32, ParseError> {
    let invalid = || ParseError::InvalidSegment(token.to_string());
    let hex = token
        .trim()
        .strip_prefix("0x")
        .or_else(|| token.trim().strip_prefix("0X"))
        .ok_or_else(invalid)?;
    let hex = hex.strip_suffix('U').unwrap_or(hex);
    if hex.is_empty() || hex.len() > 8 {
        return Err(invalid());
    }
    u32::from_str_radix(hex, 16).map_err(|_| invalid())
}

fn parse_segment(
    token: &str,
    start_addr: u32,
) -> Result<DfuMemSegment, ParseError> {
    let invalid = || ParseError::InvalidSegment(token.to_string());
    let captures = SEGMENT_REGEX.captures(token).ok_or_else(invalid)?;

    let pages: u32 = captures[1].parse().map_err(|_| invalid())?;
    let page_size: u32 = captures[2].parse().map_err(|_| invalid())?;
    let page_mul: u32 = match &captures[3] {
        "K" => 1024,
        "M" => 1024 * 1024,
        _ => 1,
    };
    let page_size = page_size.checked_mul(page_mul).ok_or_else(invalid)?;
    let end_addr = pages
        .checked_mul(page_size)
        .and_then(|size| start_addr.checked_add(size))
        .ok_or_else(invalid)?;
    let mem_type = captures[4].as_bytes()[0] & 7;

    Ok(DfuMemSegment {
        start_addr,
        end_addr,
        page_size,
        mem_type,
    })
}
