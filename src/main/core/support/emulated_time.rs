/*!
Deals with instances of time in a simulation.
*/

use crate::core::support::simulation_time::SimulationTime;

/// An instant in time (analagous to std::time::Instant) in the simulation.
// Internally represented as the number of nanoseconds since the simulation started.
#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord, Hash)]
pub struct EmulatedTime(SimulationTime);

impl EmulatedTime {
    /// The start time of the simulation. Every scheduler begins here.
    pub const SIMULATION_START: Self = Self(SimulationTime::ZERO);

    pub const MAX: Self = Self(SimulationTime::MAX);

    /// Get the instant corresponding to `val` time units since the simulation began.
    pub fn from_abs_simtime(val: SimulationTime) -> Self {
        Self(val)
    }

    /// Convert to the SimulationTime since the simulation began.
    pub fn to_abs_simtime(self) -> SimulationTime {
        self.0
    }

    /// Returns the duration since `earlier`, or panics if `earlier` is after `self`.
    pub fn duration_since(&self, earlier: &EmulatedTime) -> SimulationTime {
        self.checked_duration_since(earlier).unwrap()
    }

    /// Returns the duration since `earlier`, or `None` if `earlier` is after `self`.
    pub fn checked_duration_since(&self, earlier: &EmulatedTime) -> Option<SimulationTime> {
        self.0.checked_sub(earlier.0)
    }

    /// Returns the duration since `earlier`, or 0 if `earlier` is after `self`.
    pub fn saturating_duration_since(&self, earlier: &EmulatedTime) -> SimulationTime {
        self.0.saturating_sub(earlier.0)
    }

    pub fn checked_add(&self, other: SimulationTime) -> Option<EmulatedTime> {
        self.0.checked_add(other).map(Self)
    }

    pub fn checked_sub(&self, other: SimulationTime) -> Option<EmulatedTime> {
        self.0.checked_sub(other).map(Self)
    }

    pub fn saturating_add(&self, other: SimulationTime) -> EmulatedTime {
        Self(self.0.saturating_add(other))
    }
}

impl std::ops::Add<SimulationTime> for EmulatedTime {
    type Output = EmulatedTime;

    fn add(self, other: SimulationTime) -> Self {
        self.checked_add(other).unwrap()
    }
}

impl std::ops::AddAssign<SimulationTime> for EmulatedTime {
    fn add_assign(&mut self, rhs: SimulationTime) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<SimulationTime> for EmulatedTime {
    type Output = EmulatedTime;

    fn sub(self, other: SimulationTime) -> Self {
        self.checked_sub(other).unwrap()
    }
}

impl std::ops::Sub<EmulatedTime> for EmulatedTime {
    type Output = SimulationTime;

    fn sub(self, other: EmulatedTime) -> Self::Output {
        self.duration_since(&other)
    }
}

impl std::fmt::Display for EmulatedTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t={}", self.0)
    }
}

impl serde::Serialize for EmulatedTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // the time since the simulation started, without the "t=" prefix
        self.0.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_abs_simtime() {
        assert_eq!(
            EmulatedTime::from_abs_simtime(SimulationTime::ZERO),
            EmulatedTime::SIMULATION_START
        );

        assert_eq!(
            EmulatedTime::from_abs_simtime(SimulationTime::SECOND),
            EmulatedTime::SIMULATION_START + SimulationTime::SECOND
        );
    }

    #[test]
    fn test_to_abs_simtime() {
        assert_eq!(
            EmulatedTime::SIMULATION_START.to_abs_simtime(),
            SimulationTime::ZERO
        );

        assert_eq!(
            (EmulatedTime::SIMULATION_START + SimulationTime::SECOND).to_abs_simtime(),
            SimulationTime::SECOND
        );
    }

    #[test]
    fn test_duration_since() {
        let early = EmulatedTime::SIMULATION_START + SimulationTime::from_secs(2);
        let late = EmulatedTime::SIMULATION_START + SimulationTime::from_secs(5);
        assert_eq!(late - early, SimulationTime::from_secs(3));
        assert_eq!(early.checked_duration_since(&late), None);
        assert_eq!(
            early.saturating_duration_since(&late),
            SimulationTime::ZERO
        );
    }
}
