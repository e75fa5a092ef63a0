use crate::config::Config;

/// Manages timing of the periodic tasks, counted in scheduler ticks.
pub struct Scheduler {
    tick_count: u64,
    graph_interval: u64,
    peer_interval: u64,
    liquidity_interval: u64,
    stats_interval: u64,
    force_all: bool,
}

/// Whole ticks in `secs`, at least one.
fn ticks(secs: u64, tick_secs: u64) -> u64 {
    secs.div_ceil(tick_secs.max(1)).max(1)
}

impl Scheduler {
    pub fn new(config: &Config) -> Self {
        let tick = config.general.tick_secs;
        let schedule = &config.schedule;
        Self {
            tick_count: 0,
            graph_interval: ticks(schedule.graph_refresh_secs, tick),
            peer_interval: ticks(schedule.peer_refresh_secs, tick),
            liquidity_interval: ticks(schedule.liquidity_refresh_secs, tick),
            stats_interval: ticks(schedule.stats_secs, tick),
            force_all: false,
        }
    }

    /// Create a scheduler that forces every task to run (for run-once mode).
    pub fn new_force_all(config: &Config) -> Self {
        let mut s = Self::new(config);
        s.force_all = true;
        s
    }

    pub fn tick(&mut self) {
        self.tick_count += 1;
    }

    fn due(&self, interval: u64) -> bool {
        self.force_all || self.tick_count % interval == 0
    }

    /// Refresh gossip and save the graph snapshot.
    pub fn should_refresh_graph(&self) -> bool {
        self.due(self.graph_interval)
    }

    pub fn should_refresh_peers(&self) -> bool {
        self.due(self.peer_interval)
    }

    pub fn should_age_liquidity(&self) -> bool {
        self.due(self.liquidity_interval)
    }

    /// Log stats and purge expired store records.
    pub fn should_report_stats(&self) -> bool {
        self.due(self.stats_interval)
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config::test_default(std::path::PathBuf::from("/dev/null"))
    }

    #[test]
    fn test_tick_increments() {
        let config = test_config();
        let mut sched = Scheduler::new(&config);
        assert_eq!(sched.tick_count(), 0);
        sched.tick();
        sched.tick();
        assert_eq!(sched.tick_count(), 2);
    }

    #[test]
    fn test_intervals_in_ticks() {
        assert_eq!(ticks(600, 10), 60);
        assert_eq!(ticks(30, 10), 3);
        assert_eq!(ticks(25, 10), 3);
        assert_eq!(ticks(5, 10), 1);
    }

    #[test]
    fn test_peers_refresh_at_correct_interval() {
        let config = test_config();
        let mut sched = Scheduler::new(&config);
        // Tick 0: everything runs
        assert!(sched.should_refresh_peers());
        assert!(sched.should_refresh_graph());
        // 30s peers at 10s ticks: every third tick
        sched.tick();
        sched.tick();
        assert!(!sched.should_refresh_peers());
        sched.tick();
        assert!(sched.should_refresh_peers());
        assert!(!sched.should_refresh_graph());
    }

    #[test]
    fn test_graph_refresh_at_correct_interval() {
        let config = test_config();
        let mut sched = Scheduler::new(&config);
        for _ in 0..59 {
            sched.tick();
        }
        assert!(!sched.should_refresh_graph());
        assert!(!sched.should_report_stats());
        sched.tick();
        assert_eq!(sched.tick_count(), 60);
        assert!(sched.should_refresh_graph());
        assert!(sched.should_age_liquidity());
        assert!(sched.should_report_stats());
    }

    #[test]
    fn test_force_all_always_runs() {
        let config = test_config();
        let mut sched = Scheduler::new_force_all(&config);
        sched.tick();
        assert!(sched.should_refresh_graph());
        assert!(sched.should_refresh_peers());
        assert!(sched.should_age_liquidity());
        assert!(sched.should_report_stats());
    }
}
