// Count/sum pair for a single (span type, subtype) bucket

/// Self-time statistics of one bucket within one transaction
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LeafData {
    pub count: u64,
    pub sum_microseconds: f64,
}

impl LeafData {
    pub fn add(&mut self, self_time_in_microseconds: f64) {
        self.count += 1;
        self.sum_microseconds += self_time_in_microseconds;
    }
}
