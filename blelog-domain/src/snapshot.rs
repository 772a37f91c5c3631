use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::{device::DeviceId, device_state::DeviceState};

#[derive(PartialEq, Debug, Default, Clone)]
pub struct Snapshot(pub Vec<DeviceState>);

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum RssiComparison {
    Louder,
    Quieter,
    Same,
    New,
}

#[derive(PartialEq, Debug, Clone)]
pub struct Comparison {
    pub relative_age: Duration,
    pub rssi: RssiComparison,
}

impl Snapshot {
    /// Pairs every device with how it changed since `previous`.
    pub fn compared_to(
        &self,
        now: DateTime<Utc>,
        previous: &Snapshot,
    ) -> Vec<(DeviceState, Comparison)> {
        let before: HashMap<&DeviceId, &DeviceState> =
            previous.0.iter().map(|s| (&s.device, s)).collect();
        self.0
            .iter()
            .map(|current| {
                let rssi = match before.get(&current.device) {
                    None => RssiComparison::New,
                    Some(prior) if current.rssi > prior.rssi => RssiComparison::Louder,
                    Some(prior) if current.rssi < prior.rssi => RssiComparison::Quieter,
                    Some(_) => RssiComparison::Same,
                };
                let comparison = Comparison {
                    relative_age: now - current.date_time,
                    rssi,
                };
                (current.clone(), comparison)
            })
            .collect()
    }

    /// Devices not present in `excluded`, order preserved.
    pub fn without<'a, I>(&self, excluded: I) -> Snapshot
    where
        I: IntoIterator<Item = &'a DeviceId>,
    {
        let excluded: Vec<&DeviceId> = excluded.into_iter().collect();
        Snapshot(
            self.0
                .iter()
                .filter(|s| !excluded.contains(&&s.device))
                .cloned()
                .collect(),
        )
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for state in &self.0 {
            writeln!(
                f,
                "{} {:>21} {:>4}",
                state.device,
                state.name.as_deref().unwrap_or(""),
                state.rssi
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::{Duration, TimeZone, Utc};

    use crate::{device::DeviceId, device_state::DeviceState};

    use super::{RssiComparison, Snapshot};

    fn state(secs: i64, address: &str, rssi: i16) -> DeviceState {
        DeviceState::new(
            Utc.timestamp_opt(secs, 0).unwrap(),
            DeviceId::new(address),
            None,
            rssi,
        )
    }

    #[test]
    fn comparison_against_previous() {
        let previous = Snapshot(vec![
            state(0, "00:00:00:00:00:01", -50),
            state(0, "00:00:00:00:00:02", -50),
            state(0, "00:00:00:00:00:03", -50),
        ]);
        let current = Snapshot(vec![
            state(2, "00:00:00:00:00:01", -40),
            state(2, "00:00:00:00:00:02", -60),
            state(1, "00:00:00:00:00:03", -50),
            state(2, "00:00:00:00:00:04", -70),
        ]);
        let now = Utc.timestamp_opt(3, 0).unwrap();
        let compared = current.compared_to(now, &previous);
        let rssi: Vec<RssiComparison> = compared.iter().map(|(_, c)| c.rssi).collect();
        assert_eq!(
            rssi,
            vec![
                RssiComparison::Louder,
                RssiComparison::Quieter,
                RssiComparison::Same,
                RssiComparison::New
            ]
        );
        assert_eq!(compared[2].1.relative_age, Duration::seconds(2));
    }

    #[test]
    fn without_excludes_given_devices() {
        let snapshot = Snapshot(vec![
            state(0, "00:00:00:00:00:01", -50),
            state(0, "00:00:00:00:00:02", -50),
        ]);
        let connected = [DeviceId::new("00:00:00:00:00:01")];
        assert_eq!(
            snapshot.without(&connected),
            Snapshot(vec![state(0, "00:00:00:00:00:02", -50)])
        );
    }
}
