// Terminal output for the command-line front end

pub mod progress;


pub use progress::{describe_event, human_bytes, outcome_label, ProgressRenderer};
