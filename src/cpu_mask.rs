use std::fmt;
use std::str::FromStr;

use crate::constants::MAX_CORES;
use crate::error::Error;

/// Processor index as numbered by the kernel.
pub type CoreId = usize;

/// Fixed-capacity set of cores (bit `n` = core `n`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CoreMask(u64);

impl CoreMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn single(core: CoreId) -> Self {
        let mut mask = Self::empty();
        mask.insert(core);
        mask
    }

    /// Cores `0..count`.
    pub fn first(count: usize) -> Self {
        match count {
            0 => Self(0),
            n if n >= MAX_CORES => Self(u64::MAX),
            n => Self(!(u64::MAX << n)),
        }
    }

    pub fn insert(&mut self, core: CoreId) {
        if core < MAX_CORES {
            self.0 |= 1 << core;
        }
    }

    pub fn remove(&mut self, core: CoreId) {
        if core < MAX_CORES {
            self.0 &= !(1 << core);
        }
    }

    pub fn contains(&self, core: CoreId) -> bool {
        core < MAX_CORES && self.0 & (1 << core) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// One past the highest core in the set.
    pub fn span(&self) -> usize {
        MAX_CORES - self.0.leading_zeros() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = CoreId> + '_ {
        let bits = self.0;
        (0..MAX_CORES).filter(move |&core| bits & (1 << core) != 0)
    }
}

impl FromIterator<CoreId> for CoreMask {
    fn from_iter<I: IntoIterator<Item = CoreId>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for core in iter {
            mask.insert(core);
        }
        mask
    }
}

/// Parses the kernel cpulist format: `"0-3,6"`, `"0 1 2 3"` or an empty line.
impl FromStr for CoreMask {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = Self::empty();
        for part in s
            .trim()
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|p| !p.is_empty())
        {
            let parse = |n: &str| {
                n.parse::<CoreId>()
                    .map_err(|_| Error::Parse(format!("invalid cpu number '{n}' in cpulist '{s}'")))
            };
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (parse(lo)?, parse(hi)?),
                None => {
                    let core = parse(part)?;
                    (core, core)
                }
            };
            if lo > hi || hi >= MAX_CORES {
                return Err(Error::Parse(format!("cpu range '{part}' out of bounds")));
            }
            for core in lo..=hi {
                mask.insert(core);
            }
        }
        Ok(mask)
    }
}

/// Renders as a cpulist with ranges collapsed.
impl fmt::Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cores = self.iter().peekable();
        while let Some(start) = cores.next() {
            let mut end = start;
            while cores.peek() == Some(&(end + 1)) {
                end += 1;
                cores.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}
