pub mod election;
pub mod mongodb;
pub mod region;
pub mod vote;
pub mod voter;
