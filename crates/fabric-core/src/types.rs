//! Core value types shared across the fabric twin crates.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the fabric.
pub type NodeId = String;

/// Name of a federation (administrative grouping of nodes).
pub type FederationId = String;

/// Undirected link key in the form `{a}|{b}` with endpoints sorted.
pub type LinkId = String;

/// Identifier of a committed reservation.
pub type ReservationId = String;

/// Identifier of a job submitted for planning.
pub type JobId = String;

// ── Resources ─────────────────────────────────────────────────────

/// Resource vector held by nodes, reservations, and job stages.
///
/// Amounts are integer milli-units so that a node's allocated vector is
/// always exactly the sum of its reservations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// CPU in millicores (1000 = one core).
    pub cpu_millis: u64,
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Accelerator memory in megabytes.
    pub gpu_vram_mb: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu_millis: 0,
        memory_mb: 0,
        gpu_vram_mb: 0,
    };

    pub const fn new(cpu_millis: u64, memory_mb: u64, gpu_vram_mb: u64) -> Self {
        Self {
            cpu_millis,
            memory_mb,
            gpu_vram_mb,
        }
    }

    /// Build a vector from descriptor-style floating amounts
    /// (cores, GB of memory, GB of accelerator memory).
    pub fn from_units(cpu_cores: f64, memory_gb: f64, gpu_vram_gb: f64) -> Self {
        fn scaled(value: f64, factor: f64) -> u64 {
            if value.is_finite() && value > 0.0 {
                (value * factor).round() as u64
            } else {
                0
            }
        }
        Self {
            cpu_millis: scaled(cpu_cores, 1000.0),
            memory_mb: scaled(memory_gb, 1024.0),
            gpu_vram_mb: scaled(gpu_vram_gb, 1024.0),
        }
    }

    pub fn cpu_cores(&self) -> f64 {
        self.cpu_millis as f64 / 1000.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Component-wise `self <= other`.
    pub fn fits_within(&self, other: &Resources) -> bool {
        self.cpu_millis <= other.cpu_millis
            && self.memory_mb <= other.memory_mb
            && self.gpu_vram_mb <= other.gpu_vram_mb
    }

    pub fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu_millis: self.cpu_millis.checked_add(other.cpu_millis)?,
            memory_mb: self.memory_mb.checked_add(other.memory_mb)?,
            gpu_vram_mb: self.gpu_vram_mb.checked_add(other.gpu_vram_mb)?,
        })
    }

    /// Component-wise subtraction; `None` if any component would underflow.
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu_millis: self.cpu_millis.checked_sub(other.cpu_millis)?,
            memory_mb: self.memory_mb.checked_sub(other.memory_mb)?,
            gpu_vram_mb: self.gpu_vram_mb.checked_sub(other.gpu_vram_mb)?,
        })
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            gpu_vram_mb: self.gpu_vram_mb.saturating_sub(other.gpu_vram_mb),
        }
    }

    /// Highest per-component usage ratio of `self` against `capacity`.
    ///
    /// Components with zero capacity are ignored. Returns 0.0 for an
    /// all-zero capacity vector.
    pub fn utilization(&self, capacity: &Resources) -> f64 {
        self.ratios(capacity).fold(0.0, f64::max)
    }

    /// Mean per-component usage ratio over components with capacity.
    pub fn mean_utilization(&self, capacity: &Resources) -> f64 {
        let (sum, count) = self
            .ratios(capacity)
            .fold((0.0, 0usize), |(s, c), r| (s + r, c + 1));
        if count == 0 { 0.0 } else { sum / count as f64 }
    }

    fn ratios(&self, capacity: &Resources) -> impl Iterator<Item = f64> {
        [
            (self.cpu_millis, capacity.cpu_millis),
            (self.memory_mb, capacity.memory_mb),
            (self.gpu_vram_mb, capacity.gpu_vram_mb),
        ]
        .into_iter()
        .filter(|(_, cap)| *cap > 0)
        .map(|(used, cap)| used as f64 / cap as f64)
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_add(rhs.cpu_millis),
            memory_mb: self.memory_mb.saturating_add(rhs.memory_mb),
            gpu_vram_mb: self.gpu_vram_mb.saturating_add(rhs.gpu_vram_mb),
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Self {
        iter.fold(Resources::ZERO, |acc, r| acc + r)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m mem={}MB vram={}MB",
            self.cpu_millis, self.memory_mb, self.gpu_vram_mb
        )
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Health of a node or link as reported by overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Up,
    Degraded,
    Down,
}

impl HealthStatus {
    /// Whether new work may be admitted.
    pub fn is_available(&self) -> bool {
        !matches!(self, HealthStatus::Down)
    }

    /// Contribution of this status to the risk score, in `[0, 1]`.
    pub fn degradation(&self) -> f64 {
        match self {
            HealthStatus::Up => 0.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Down => 1.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Up => "up",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        })
    }
}

// ── Helpers ───────────────────────────────────────────────────────

/// Canonical key for the undirected link between `a` and `b`.
pub fn link_key(a: &str, b: &str) -> LinkId {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

/// Split a link key back into its two endpoints.
pub fn link_endpoints(key: &str) -> Option<(&str, &str)> {
    let (a, b) = key.split_once('|')?;
    (!a.is_empty() && !b.is_empty()).then_some((a, b))
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
