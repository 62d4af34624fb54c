use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

pub const KIB: u64 = 1 << 10;
pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;
pub const TIB: u64 = 1 << 40;

/// A quantity of compute: CPU count plus memory and disk in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: u64,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub disk: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu: 0,
        memory: 0,
        disk: 0,
    };

    /// Unlimited capacity, for executors that do not account resources.
    pub const MAX: Resources = Resources {
        cpu: u64::MAX,
        memory: u64::MAX,
        disk: u64::MAX,
    };

    pub fn new(cpu: u64, memory: u64, disk: u64) -> Self {
        Self { cpu, memory, disk }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Component-wise `self <= other`.
    pub fn fits_within(&self, other: &Resources) -> bool {
        self.cpu <= other.cpu && self.memory <= other.memory && self.disk <= other.disk
    }

    /// Used to rank pending work for largest-first scheduling.
    pub fn weight(&self) -> (u64, u64, u64) {
        (self.memory, self.cpu, self.disk)
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(rhs.cpu),
            memory: self.memory.saturating_add(rhs.memory),
            disk: self.disk.saturating_add(rhs.disk),
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self = *self + rhs;
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(self, rhs: Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(rhs.cpu),
            memory: self.memory.saturating_sub(rhs.memory),
            disk: self.disk.saturating_sub(rhs.disk),
        }
    }
}

impl SubAssign for Resources {
    fn sub_assign(&mut self, rhs: Resources) {
        *self = *self - rhs;
    }
}

fn human_bytes(n: u64) -> String {
    if n == u64::MAX {
        return "unlimited".to_string();
    }
    let units = [(TIB, "TiB"), (GIB, "GiB"), (MIB, "MiB"), (KIB, "KiB")];
    for (size, suffix) in units {
        if n >= size {
            return format!("{:.1}{}", n as f64 / size as f64, suffix);
        }
    }
    format!("{}B", n)
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpu = if self.cpu == u64::MAX {
            "unlimited".to_string()
        } else {
            self.cpu.to_string()
        };
        write!(
            f,
            "{{cpu: {}, memory: {}, disk: {}}}",
            cpu,
            human_bytes(self.memory),
            human_bytes(self.disk)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_within_is_componentwise() {
        let cap = Resources::new(8, 16 * GIB, 100 * GIB);
        assert!(Resources::new(8, 16 * GIB, 0).fits_within(&cap));
        assert!(!Resources::new(9, GIB, 0).fits_within(&cap));
        assert!(!Resources::new(1, 17 * GIB, 0).fits_within(&cap));
        assert!(Resources::ZERO.fits_within(&Resources::ZERO));
    }

    #[test]
    fn test_add_and_saturating_sub() {
        let a = Resources::new(2, 4 * GIB, 0);
        let b = Resources::new(1, GIB, 10);
        assert_eq!(a + b, Resources::new(3, 5 * GIB, 10));
        assert_eq!(b - a, Resources::new(0, 0, 10));
        assert_eq!(Resources::MAX + a, Resources::MAX);
    }

    #[test]
    fn test_display() {
        let r = Resources::new(32, 32 * GIB, 0);
        assert_eq!(r.to_string(), "{cpu: 32, memory: 32.0GiB, disk: 0B}");
    }
}
