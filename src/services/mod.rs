pub mod audit;
pub mod calendar;
pub mod compliance;
pub mod connector;
pub mod hashing;
pub mod ical;
pub mod properties;
pub mod queue;
pub mod reservations;
pub mod scheduler;

#[cfg(test)]
pub mod testing;
