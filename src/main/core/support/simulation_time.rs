/*!
Values for working with a simulated duration. Use [`EmulatedTime`] to represent an instant in
time.

[`EmulatedTime`]: super::emulated_time::EmulatedTime
*/

use std::time::Duration;

/// A duration of simulated time, with nanosecond granularity.
#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord, Hash, Default)]
pub struct SimulationTime(u64);

/// Represents one nanosecond in simulation time.
const ONE_NANOSECOND: u64 = 1;
/// Represents one microsecond in simulation time.
const ONE_MICROSECOND: u64 = 1_000;
/// Represents one millisecond in simulation time.
const ONE_MILLISECOND: u64 = 1_000_000;
/// Represents one second in simulation time.
const ONE_SECOND: u64 = 1_000_000_000;

impl SimulationTime {
    pub const MAX: SimulationTime = SimulationTime(u64::MAX);
    pub const ZERO: SimulationTime = SimulationTime(0);
    pub const SECOND: SimulationTime = SimulationTime(ONE_SECOND);
    pub const MILLISECOND: SimulationTime = SimulationTime(ONE_MILLISECOND);
    pub const MICROSECOND: SimulationTime = SimulationTime(ONE_MICROSECOND);
    pub const NANOSECOND: SimulationTime = SimulationTime(ONE_NANOSECOND);

    /// Convert a [`Duration`] to a [`SimulationTime`]. This function exists as a `const`
    /// alternative to `SimulationTime::try_from(duration)`. Panics if the duration is too large.
    pub const fn from_duration(val: Duration) -> Self {
        let val = val.as_nanos();
        if val > u64::MAX as u128 {
            panic!("Duration is larger than SimulationTime::MAX");
        }

        Self(val as u64)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / ONE_SECOND
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / ONE_MILLISECOND
    }

    pub fn as_micros(&self) -> u64 {
        self.0 / ONE_MICROSECOND
    }

    pub fn as_nanos(&self) -> u128 {
        self.0.into()
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / ONE_SECOND as f64
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn checked_mul(self, other: u64) -> Option<Self> {
        self.0.checked_mul(other).map(Self)
    }

    pub fn checked_div(self, other: u64) -> Option<Self> {
        self.0.checked_div(other).map(Self)
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    pub fn saturating_mul(self, other: u64) -> Self {
        Self(self.0.saturating_mul(other))
    }

    pub fn try_from_secs(s: u64) -> Option<Self> {
        Self::SECOND.checked_mul(s)
    }

    pub fn from_secs(s: u64) -> Self {
        Self::SECOND.saturating_mul(s)
    }

    pub fn try_from_millis(s: u64) -> Option<Self> {
        Self::MILLISECOND.checked_mul(s)
    }

    pub fn from_millis(s: u64) -> Self {
        Self::MILLISECOND.saturating_mul(s)
    }

    pub fn from_micros(s: u64) -> Self {
        Self::MICROSECOND.saturating_mul(s)
    }

    pub fn from_nanos(s: u64) -> Self {
        Self(s)
    }

    /// A duration from fractional seconds, rounded down to the nearest nanosecond. Negative and
    /// NaN inputs produce zero; values too large to represent saturate.
    pub fn from_secs_f64(s: f64) -> Self {
        let nanos = s * ONE_SECOND as f64;
        if nanos.is_nan() || nanos <= 0.0 {
            Self::ZERO
        } else if nanos >= u64::MAX as f64 {
            Self::MAX
        } else {
            Self(nanos as u64)
        }
    }

    pub fn subsec_millis(&self) -> u32 {
        // always < 1000
        (self.as_millis() % 1_000) as u32
    }

    pub fn subsec_nanos(&self) -> u32 {
        (self.0 % ONE_SECOND) as u32
    }
}

impl std::ops::Add<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn add(self, other: Self) -> Self::Output {
        self.checked_add(other).unwrap()
    }
}

impl std::ops::AddAssign<SimulationTime> for SimulationTime {
    fn add_assign(&mut self, rhs: SimulationTime) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn sub(self, other: Self) -> Self::Output {
        self.checked_sub(other).unwrap()
    }
}

impl std::ops::SubAssign<SimulationTime> for SimulationTime {
    fn sub_assign(&mut self, rhs: SimulationTime) {
        *self = *self - rhs;
    }
}

impl std::ops::Mul<u32> for SimulationTime {
    type Output = SimulationTime;

    fn mul(self, other: u32) -> Self::Output {
        self.checked_mul(other.into()).unwrap()
    }
}

impl std::ops::Div<u32> for SimulationTime {
    type Output = SimulationTime;

    fn div(self, other: u32) -> Self::Output {
        self.checked_div(other.into()).unwrap()
    }
}

impl From<SimulationTime> for Duration {
    fn from(val: SimulationTime) -> Duration {
        Duration::from_nanos(val.0)
    }
}

impl TryFrom<Duration> for SimulationTime {
    type Error = ();

    fn try_from(val: Duration) -> Result<Self, Self::Error> {
        let nanos = u64::try_from(val.as_nanos()).map_err(|_| ())?;
        Ok(Self(nanos))
    }
}

impl std::fmt::Display for SimulationTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.subsec_nanos() == 0 {
            write!(f, "{}s", self.as_secs())
        } else {
            write!(f, "{:.3}s", self.as_secs_f64())
        }
    }
}

impl serde::Serialize for SimulationTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(SimulationTime::from_secs(2).as_millis(), 2_000);
        assert_eq!(SimulationTime::from_millis(1_500).as_secs(), 1);
        assert_eq!(SimulationTime::from_millis(1_500).subsec_millis(), 500);
        assert_eq!(
            Duration::from(SimulationTime::from_micros(3)),
            Duration::from_micros(3)
        );
        assert_eq!(
            SimulationTime::try_from(Duration::from_secs(4)),
            Ok(SimulationTime::from_secs(4))
        );
    }

    #[test]
    fn test_from_secs_f64() {
        assert_eq!(
            SimulationTime::from_secs_f64(0.25),
            SimulationTime::from_millis(250)
        );
        assert_eq!(SimulationTime::from_secs_f64(-1.0), SimulationTime::ZERO);
        assert_eq!(SimulationTime::from_secs_f64(f64::NAN), SimulationTime::ZERO);
        assert_eq!(SimulationTime::from_secs_f64(1e30), SimulationTime::MAX);
    }

    #[test]
    fn test_saturating() {
        assert_eq!(
            SimulationTime::ZERO.saturating_sub(SimulationTime::SECOND),
            SimulationTime::ZERO
        );
        assert_eq!(
            SimulationTime::MAX.saturating_add(SimulationTime::SECOND),
            SimulationTime::MAX
        );
        assert_eq!(SimulationTime::SECOND.checked_sub(SimulationTime::MAX), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(SimulationTime::from_secs(3).to_string(), "3s");
        assert_eq!(SimulationTime::from_millis(3_250).to_string(), "3.250s");
    }
}
