//! Stay ranges.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A half-open span of nights `[check_in, check_out)`.
///
/// Used for reservation stays and for the date range a publish task covers.
/// Construction guarantees `check_out > check_in`, so a range always contains
/// at least one night.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawStayRange")]
pub struct StayRange {
    check_in: NaiveDate,
    check_out: NaiveDate,
}

#[derive(Deserialize)]
struct RawStayRange {
    check_in: NaiveDate,
    check_out: NaiveDate,
}

impl TryFrom<RawStayRange> for StayRange {
    type Error = DomainError;

    fn try_from(raw: RawStayRange) -> Result<Self, Self::Error> {
        StayRange::new(raw.check_in, raw.check_out)
    }
}

impl StayRange {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> DomainResult<Self> {
        if check_out <= check_in {
            return Err(DomainError::validation(format!(
                "check_out ({check_out}) must be after check_in ({check_in})"
            )));
        }
        Ok(Self {
            check_in,
            check_out,
        })
    }

    /// A single night starting on `date`.
    pub fn single_night(date: NaiveDate) -> DomainResult<Self> {
        let next = date
            .succ_opt()
            .ok_or_else(|| DomainError::validation("date out of range"))?;
        Self::new(date, next)
    }

    pub fn check_in(&self) -> NaiveDate {
        self.check_in
    }

    pub fn check_out(&self) -> NaiveDate {
        self.check_out
    }

    pub fn nights(&self) -> u32 {
        (self.check_out - self.check_in).num_days() as u32
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.check_in && date < self.check_out
    }

    pub fn overlaps(&self, other: &StayRange) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }

    /// Every night in the range, in ascending order.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.check_out;
        self.check_in.iter_days().take_while(move |d| *d < end)
    }

    /// Smallest range covering both `self` and `other`.
    pub fn cover(&self, other: &StayRange) -> StayRange {
        StayRange {
            check_in: self.check_in.min(other.check_in),
            check_out: self.check_out.max(other.check_out),
        }
    }
}

impl core::fmt::Display for StayRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}..{}", self.check_in, self.check_out)
    }
}
