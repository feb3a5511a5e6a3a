
use clap::Parser;
use std::process;
use crate::app::{Commands, Run};

mod app;
mod commands;
mod externals;
mod filter;
mod flatten;
mod pathfilter;
mod record;
mod repos;
mod util;

fn main() {
    match Commands::parse().run() {
        Ok(_) => {
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{:?}", e);
            process::exit(1);
        }
    }
}
