use std::ffi::OsStr;
use std::io::Write;

use anyhow::{self, Context};
use clap::Parser;

use crate::core::configuration::{CliOptions, ConfigFileOptions, ConfigOptions};
use crate::core::logger::sim_logger;
use crate::core::scheduler::WallClock;
use crate::core::simulation::{Simulation, SimulationReport};
use crate::core::support::emulated_time::EmulatedTime;
use crate::core::support::simulation_time::SimulationTime;

/// Main entry point for the simulator.
pub fn run_netsim(args: Vec<&OsStr>) -> anyhow::Result<()> {
    // parse the options from the command line
    let options = match CliOptions::try_parse_from(args) {
        Ok(x) => x,
        Err(e) => {
            if e.use_stderr() {
                eprint!("{}", e);
                std::process::exit(1);
            } else {
                print!("{}", e);
                std::process::exit(0);
            }
        }
    };

    // read from stdin if the config filename is given as '-'
    let config_file: ConfigFileOptions = match options.config.as_str() {
        "-" => serde_yaml::from_reader(std::io::stdin())
            .context("Could not parse the configuration from stdin")?,
        filename => {
            let file = std::fs::File::open(filename)
                .with_context(|| format!("Could not open config file {filename:?}"))?;
            serde_yaml::from_reader(file)
                .with_context(|| format!("Could not parse configuration file {filename:?}"))?
        }
    };

    // generate the final configuration from the config file and cli options
    let config = ConfigOptions::new(config_file, options.clone());

    if options.show_config {
        serde_yaml::to_writer(std::io::stdout(), &config)
            .context("Failed to write the configuration")?;
        return Ok(());
    }

    let log_level: log::Level = config
        .general
        .log_level
        .context("The log level was not set")?
        .into();
    sim_logger::init(log_level.to_level_filter(), false)
        .map_err(|e| anyhow::anyhow!("Failed to start the logger: {e}"))?;

    // check if some log levels have been compiled out
    if log_level > log::STATIC_MAX_LEVEL {
        log::warn!(
            "Log level set to {}, but messages higher than {} have been compiled out",
            log_level,
            log::STATIC_MAX_LEVEL,
        );
    }

    let stop_time: SimulationTime = config
        .general
        .stop_time
        .context("The stop time must be set in the configuration file or on the command line")?
        .into();
    let heartbeat: SimulationTime = config
        .general
        .heartbeat_interval
        .context("The heartbeat interval was not set")?
        .into();

    let mut sim = Simulation::from_config(&config).context("Failed to build the simulation")?;
    log::info!(
        "Starting the simulation with {} hosts and {} links",
        sim.hosts().len(),
        sim.links().len()
    );

    let report = run(&mut sim, stop_time, heartbeat, config.general.time_multiplier.is_some());
    log::info!("Finished the simulation");

    let mut stdout = std::io::stdout().lock();
    serde_yaml::to_writer(&mut stdout, &report).context("Failed to write the report")?;
    stdout.flush()?;

    Ok(())
}

/// Run until `stop_time`, logging a heartbeat every `heartbeat` of virtual time. When `paced`,
/// virtual time follows the wall clock at the simulation's time multiplier, so the run can end
/// slightly past `stop_time`.
fn run(
    sim: &mut Simulation,
    stop_time: SimulationTime,
    heartbeat: SimulationTime,
    paced: bool,
) -> SimulationReport {
    let end = EmulatedTime::SIMULATION_START + stop_time;
    let step = if heartbeat.is_positive() {
        heartbeat
    } else {
        stop_time
    };

    let mut clock = paced.then(WallClock::new);
    let mut next_heartbeat = std::cmp::min(EmulatedTime::SIMULATION_START + step, end);
    let mut executed = 0;

    while sim.now() < end {
        executed += match &mut clock {
            Some(clock) => {
                let remaining = next_heartbeat.saturating_duration_since(&sim.now());
                let max_sleep = sim.wall_delay(remaining);
                std::thread::sleep(clock.time_until_next_event(sim.scheduler_mut(), max_sleep));
                clock.tick(sim)
            }
            None => sim.advance_to(next_heartbeat),
        };

        if sim.now() >= next_heartbeat {
            log::info!(
                "Heartbeat: {} of {stop_time} simulated, {executed} events since the last heartbeat",
                sim.elapsed(),
            );
            executed = 0;
            next_heartbeat = std::cmp::min(sim.now() + step, end);
        }
    }

    sim.report()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn run_stops_at_stop_time() {
        let yaml = r#"
general:
  stop_time: 25 s
hosts:
  a:
    role: computer
    services: [arp]
    interfaces:
      - name: eth0
        address: 192.168.1.1/24
  b:
    role: computer
    services: [arp]
    interfaces:
      - name: eth0
        address: 192.168.1.2/24
links:
  - ends: ["a:eth0", "b:eth0"]
"#;
        let file = ConfigFileOptions::from_str(yaml).unwrap();
        let cli = CliOptions::try_parse_from(["netsim", "-"]).unwrap();
        let config = ConfigOptions::new(file, cli);
        let mut sim = Simulation::from_config(&config).unwrap();

        let report = run(
            &mut sim,
            SimulationTime::from_secs(25),
            SimulationTime::from_secs(10),
            false,
        );
        assert_eq!(report.time, SimulationTime::from_secs(25));
        assert_eq!(report.hosts.len(), 2);
    }

    #[test]
    fn paced_run_follows_wall_clock() {
        let mut sim = Simulation::default();
        sim.set_time_multiplier(200.0);
        let started = std::time::Instant::now();
        let report = run(
            &mut sim,
            SimulationTime::from_secs(4),
            SimulationTime::from_secs(1),
            true,
        );
        assert!(report.time >= SimulationTime::from_secs(4));
        // 4 simulated seconds at 200x take at least 20 ms
        assert!(started.elapsed() >= std::time::Duration::from_millis(19));
    }
}
