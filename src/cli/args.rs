use std::fmt;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum Assembler {
    #[default]
    Unicycler,
    Canu,
    Miniasm,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum AssemblyType {
    #[default]
    Short,
    Long,
    Hybrid,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum PolishMethod {
    #[default]
    Medaka,
    Nanopolish,
}

/// What a join does with a sample that only one side delivered.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Drop the sample from the join; its dependants are skipped.
    #[default]
    Skip,
    /// Emit the side that arrived on its own.
    NullFill,
    /// Abort the whole run.
    Fatal,
}

macro_rules! value_enum_display {
    ($($t:ty),*) => {
        $(
            impl fmt::Display for $t {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    match self.to_possible_value() {
                        Some(value) => f.write_str(value.get_name()),
                        None => write!(f, "{:?}", self),
                    }
                }
            }
        )*
    };
}

value_enum_display!(Assembler, AssemblyType, PolishMethod, JoinPolicy);

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "bacass-pipelines", version, about = "Bacterial genome assembly pipeline runner")]
pub struct Arguments {
    #[arg(short = 'i', long = "input", help = "Sample manifest with columns ID, R1, R2, LongFastQ, Fast5, GenomeSize")]
    pub input: String,

    #[arg(short = 'o', long = "outdir", default_value = "results")]
    pub out_dir: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long, default_value = "unicycler", value_enum)]
    pub assembler: Assembler,

    #[arg(long = "assembly-type", default_value = "short", value_enum)]
    pub assembly_type: AssemblyType,

    #[arg(long = "polish-method", default_value = "medaka", value_enum)]
    pub polish_method: PolishMethod,

    #[arg(long = "join-policy", default_value = "skip", value_enum, help = "Handling of samples missing one side of a join")]
    pub join_policy: JoinPolicy,

    #[arg(long = "skip-kraken2", action)]
    pub skip_kraken2: bool,

    #[arg(short = 'k', long = "kraken2-db")]
    pub kraken2_db: Option<String>,

    #[arg(long = "genome-size", help = "Expected genome size for canu, e.g. 4.6m; overridden per sample by GenomeSize")]
    pub genome_size: Option<String>,

    #[arg(long = "unicycler-args", default_value = "", allow_hyphen_values = true)]
    pub unicycler_args: String,

    #[arg(long = "prokka-args", default_value = "", allow_hyphen_values = true)]
    pub prokka_args: String,

    #[arg(long = "fast5-dir", help = "Base directory for relative Fast5 paths in the manifest")]
    pub fast5_dir: Option<String>,

    #[arg(long)]
    pub email: Option<String>,

    #[arg(long = "skip-annotation", action)]
    pub skip_annotation: bool,

    #[arg(long = "skip-polish", action)]
    pub skip_polish: bool,

    #[arg(long = "dry-run", action, help = "Render every command and touch declared outputs without running tools")]
    pub dry_run: bool,

    #[arg(long = "max-cpus", help = "Cap on CPUs reserved by any one task; defaults to the host's logical CPUs")]
    pub max_cpus: Option<usize>,

    #[arg(long = "max-memory", help = "Cap on memory (GB) reserved by any one task; defaults to the host's total RAM")]
    pub max_memory: Option<u64>,
}
