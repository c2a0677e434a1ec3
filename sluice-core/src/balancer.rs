//! Event manager selection
//!
//! Channels go to the live manager with the fewest channels (ties to the
//! lowest index), listeners rotate round-robin over live managers. The
//! balancer lives inside the pool's shared state and is only touched under
//! its lock.

/// Per-manager channel counts and liveness
#[derive(Debug, Clone)]
pub struct Balancer {
    loads: Vec<usize>,
    alive: Vec<bool>,
    counter: usize,
}

impl Balancer {
    pub fn new(managers: usize) -> Self {
        Self { loads: vec![0; managers], alive: vec![true; managers], counter: 0 }
    }

    /// Least-loaded live manager; `None` once every manager is dead
    pub fn least_loaded(&self) -> Option<usize> {
        self.loads
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.alive[*idx])
            .min_by_key(|(idx, load)| (**load, *idx))
            .map(|(idx, _)| idx)
    }

    /// Next live manager in round-robin order
    pub fn next_round_robin(&mut self) -> Option<usize> {
        let total = self.loads.len();

        for _ in 0..total {
            let idx = self.counter % total;
            self.counter = self.counter.wrapping_add(1);

            if self.alive[idx] {
                return Some(idx);
            }
        }

        None
    }

    /// Record a channel assigned to `manager`
    pub fn add(&mut self, manager: usize) {
        if let Some(load) = self.loads.get_mut(manager) {
            *load += 1;
        }
    }

    /// Record a channel released by `manager`
    pub fn remove(&mut self, manager: usize) {
        if let Some(load) = self.loads.get_mut(manager) {
            *load = load.saturating_sub(1);
        }
    }

    /// Take a manager out of rotation; its load drops to zero
    pub fn mark_dead(&mut self, manager: usize) {
        if let Some(alive) = self.alive.get_mut(manager) {
            *alive = false;
            self.loads[manager] = 0;
        }
    }

    pub fn loads(&self) -> &[usize] {
        &self.loads
    }
}
