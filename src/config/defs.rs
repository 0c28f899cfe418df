use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use thiserror::Error;

use crate::cli::{Arguments, Assembler, AssemblyType, JoinPolicy, PolishMethod};
use crate::dataflow::node::{ResourceClass, Resources};
use crate::utils::command::split_extra_args;
use crate::utils::file::resolve_path;
use crate::utils::system::detect_host_resources;

pub const PIPELINE_NAME: &str = "bacass";

// External software
pub const FASTQC_TAG: &str = "fastqc";
pub const SKEWER_TAG: &str = "skewer";
pub const PORECHOP_TAG: &str = "porechop";
pub const NANOPLOT_TAG: &str = "NanoPlot";
pub const PYCOQC_TAG: &str = "pycoQC";
pub const UNICYCLER_TAG: &str = "unicycler";
pub const CANU_TAG: &str = "canu";
pub const MINIASM_TAG: &str = "miniasm";
pub const MINIMAP2_TAG: &str = "minimap2";
pub const RACON_TAG: &str = "racon";
pub const MEDAKA_TAG: &str = "medaka";
pub const NANOPOLISH_TAG: &str = "nanopolish";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const KRAKEN2_TAG: &str = "kraken2";
pub const QUAST_TAG: &str = "quast.py";
pub const PROKKA_TAG: &str = "prokka";
pub const BANDAGE_TAG: &str = "Bandage";
pub const MULTIQC_TAG: &str = "multiqc";
pub const SENDMAIL_TAG: &str = "sendmail";

// Files carried by source channels
pub const SHORT_READS_1: &str = "short_reads_1";
pub const SHORT_READS_2: &str = "short_reads_2";
pub const LONG_READS: &str = "long_reads";
pub const FAST5: &str = "fast5";

// Static filenames
pub const PIPELINE_INFO_DIR: &str = "pipeline_info";
pub const REPORT_JSON: &str = "run_report.json";
pub const REPORT_FRAGMENTS_TSV: &str = "report_fragments.tsv";
pub const EXECUTION_SUMMARY_TSV: &str = "execution_summary.tsv";
pub const RUN_SUMMARY_TXT: &str = "run_summary.txt";

lazy_static! {
    /// Baseline reservation per resource class, before host caps.
    pub static ref RESOURCE_CLASSES: HashMap<ResourceClass, Resources> = {
        let mut m = HashMap::new();
        m.insert(ResourceClass::Small, Resources { cpus: 2, memory_gb: 12 });
        m.insert(ResourceClass::Medium, Resources { cpus: 6, memory_gb: 36 });
        m.insert(ResourceClass::Large, Resources { cpus: 12, memory_gb: 72 });
        m
    };
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Malformed manifest at line {line}: {reason}")]
    MalformedManifest { line: u64, reason: String },

    #[error("Task {task} failed for {sample}: {error}")]
    TaskExecution {
        task: String,
        sample: String,
        error: String,
    },

    #[error("Join {join}: sample {sample} is missing one side")]
    JoinMismatch { join: String, sample: String },

    #[error("Aggregation {0} has no contributing inputs")]
    AggregationIncomplete(String),

    #[error("Invalid pipeline graph: {0}")]
    Graph(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}

/// Validated, immutable run parameters. Built once from the command line and
/// shared behind an `Arc` for the whole run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub manifest: PathBuf,
    pub out_dir: PathBuf,
    pub assembler: Assembler,
    pub assembly_type: AssemblyType,
    pub polish_method: PolishMethod,
    pub join_policy: JoinPolicy,
    pub skip_kraken2: bool,
    pub kraken2_db: Option<PathBuf>,
    pub genome_size: Option<String>,
    pub unicycler_args: Vec<String>,
    pub prokka_args: Vec<String>,
    pub fast5_dir: Option<PathBuf>,
    pub email: Option<String>,
    pub skip_annotation: bool,
    pub skip_polish: bool,
    pub dry_run: bool,
    pub max_cpus: usize,
    pub max_memory_gb: u64,
}

impl RunConfig {
    /// Resolves paths against `cwd`, fills host-derived caps and validates.
    ///
    /// # Arguments
    /// * `args` - Parsed command line.
    /// * `cwd` - Directory relative paths are resolved against.
    ///
    /// # Returns
    /// A validated RunConfig, or PipelineError::Configuration.
    pub fn from_args(args: &Arguments, cwd: &Path) -> Result<Self, PipelineError> {
        let (max_cpus, max_memory_gb) = match (args.max_cpus, args.max_memory) {
            (Some(cpus), Some(memory)) => (cpus, memory),
            (cpus, memory) => {
                let (host_cpus, host_memory) = detect_host_resources()
                    .map_err(|e| PipelineError::Configuration(format!("Cannot detect host resources: {}", e)))?;
                (cpus.unwrap_or(host_cpus), memory.unwrap_or(host_memory))
            }
        };

        let config = RunConfig {
            cwd: cwd.to_path_buf(),
            manifest: resolve_path(Path::new(&args.input), cwd),
            out_dir: resolve_path(Path::new(&args.out_dir), cwd),
            assembler: args.assembler,
            assembly_type: args.assembly_type,
            polish_method: args.polish_method,
            join_policy: args.join_policy,
            skip_kraken2: args.skip_kraken2,
            kraken2_db: args.kraken2_db.as_ref().map(|db| resolve_path(Path::new(db), cwd)),
            genome_size: args.genome_size.clone().filter(|g| !g.trim().is_empty()),
            unicycler_args: split_extra_args(&args.unicycler_args),
            prokka_args: split_extra_args(&args.prokka_args),
            fast5_dir: args.fast5_dir.as_ref().map(|dir| resolve_path(Path::new(dir), cwd)),
            email: args.email.clone().filter(|e| !e.trim().is_empty()),
            skip_annotation: args.skip_annotation,
            skip_polish: args.skip_polish,
            dry_run: args.dry_run,
            max_cpus: max_cpus.max(1),
            max_memory_gb: max_memory_gb.max(1),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.assembler == Assembler::Canu && self.genome_size.is_none() {
            return Err(PipelineError::Configuration(
                "--genome-size is required when --assembler canu is selected".to_string(),
            ));
        }

        if matches!(self.assembler, Assembler::Canu | Assembler::Miniasm) && self.assembly_type != AssemblyType::Long {
            return Err(PipelineError::Configuration(format!(
                "--assembler {} only supports --assembly-type long, got {}",
                self.assembler, self.assembly_type
            )));
        }

        if !self.skip_kraken2 {
            match &self.kraken2_db {
                None => {
                    return Err(PipelineError::Configuration(
                        "--kraken2-db is required unless --skip-kraken2 is set".to_string(),
                    ));
                }
                Some(db) if !db.exists() => {
                    return Err(PipelineError::Configuration(format!(
                        "Kraken2 database {} does not exist",
                        db.display()
                    )));
                }
                Some(_) => {}
            }
        }

        if !self.manifest.is_file() {
            return Err(PipelineError::Configuration(format!(
                "Manifest {} does not exist",
                self.manifest.display()
            )));
        }

        Ok(())
    }

    pub fn long_reads_enabled(&self) -> bool {
        self.assembly_type != AssemblyType::Short
    }

    /// Reservation for a resource class, capped by the run's limits.
    pub fn resources(&self, class: ResourceClass) -> Resources {
        let base = RESOURCE_CLASSES
            .get(&class)
            .copied()
            .unwrap_or(Resources { cpus: 1, memory_gb: 1 });
        Resources {
            cpus: base.cpus.min(self.max_cpus),
            memory_gb: base.memory_gb.min(self.max_memory_gb),
        }
    }

    /// Parameter snapshot rendered into the run report.
    pub fn summary(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("input".to_string(), self.manifest.display().to_string());
        m.insert("outdir".to_string(), self.out_dir.display().to_string());
        m.insert("assembler".to_string(), self.assembler.to_string());
        m.insert("assembly_type".to_string(), self.assembly_type.to_string());
        m.insert("join_policy".to_string(), self.join_policy.to_string());
        m.insert("skip_kraken2".to_string(), self.skip_kraken2.to_string());
        if let Some(db) = &self.kraken2_db {
            m.insert("kraken2_db".to_string(), db.display().to_string());
        }
        if let Some(size) = &self.genome_size {
            m.insert("genome_size".to_string(), size.clone());
        }
        if self.long_reads_enabled() {
            m.insert("polish_method".to_string(), self.polish_method.to_string());
            m.insert("skip_polish".to_string(), self.skip_polish.to_string());
        }
        if !self.unicycler_args.is_empty() {
            m.insert("unicycler_args".to_string(), self.unicycler_args.join(" "));
        }
        if !self.prokka_args.is_empty() {
            m.insert("prokka_args".to_string(), self.prokka_args.join(" "));
        }
        if let Some(dir) = &self.fast5_dir {
            m.insert("fast5_dir".to_string(), dir.display().to_string());
        }
        if let Some(email) = &self.email {
            m.insert("email".to_string(), email.clone());
        }
        m.insert("skip_annotation".to_string(), self.skip_annotation.to_string());
        m.insert("dry_run".to_string(), self.dry_run.to_string());
        m.insert("max_cpus".to_string(), self.max_cpus.to_string());
        m.insert("max_memory".to_string(), format!("{} GB", self.max_memory_gb));
        m
    }
}
