/// The tracee progress clock: one tick per retired conditional branch,
/// counted by a hardware performance counter. Monotonically non-decreasing
/// over a task's life.
pub type Ticks = u64;
