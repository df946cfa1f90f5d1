//! Hard caps enforced before anything is written to the WAL.

pub const MAX_PROFILES_PER_STUDIO: usize = 10_000;
pub const MAX_SUBJECTS_PER_STUDIO: usize = 1_000;
pub const MAX_SHIFTS_PER_STUDIO: usize = 100_000;
pub const MAX_RESERVATIONS_PER_STUDIO: usize = 500_000;
pub const MAX_SUBJECTS_PER_SHIFT: usize = 32;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_NOTES_LEN: usize = 4_096;

pub const MAX_STUDIOS: usize = 1_024;
pub const MAX_STUDIO_NAME_LEN: usize = 128;
