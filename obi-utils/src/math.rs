pub fn roundup_div(lhs: u64, rhs: u64) -> u64 {
    (lhs + rhs - 1) / rhs
}

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;
