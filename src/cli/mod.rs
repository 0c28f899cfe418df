pub mod args;

use clap::Parser;

pub use args::{Arguments, Assembler, AssemblyType, JoinPolicy, PolishMethod};

pub fn parse() -> Arguments {
    Arguments::parse()
}
