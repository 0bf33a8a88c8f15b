pub mod download;
pub mod engine;
pub mod fetch;
pub mod geo;
pub mod model;
pub mod parser;
pub mod realtime;
pub mod schedule;
pub mod service;
pub mod timefmt;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
