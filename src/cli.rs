use clap::{Args, Parser, Subcommand};

use crate::{ordering::OrderingMethod, weights::NNLSParams};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct ProgramArgs {
    #[command(subcommand)]
    pub subcommand: ProgramSubcommand,
    #[arg(
        short,
        long,
        default_value = "1",
        global = true,
        help = "Number of threads to use."
    )]
    pub threads: usize,
    #[arg(
        short,
        long,
        default_value = "false",
        conflicts_with = "quiet",
        global = true
    )]
    pub verbose: bool,
    #[arg(
        short,
        long,
        default_value = "false",
        conflicts_with = "verbose",
        global = true
    )]
    pub quiet: bool,
    #[arg(
        short = 'd',
        long,
        default_value = "output",
        global = true,
        help = "Output directory"
    )]
    pub output_directory: String,
}

#[derive(Subcommand, Debug)]
pub enum ProgramSubcommand {
    #[clap(
        name = "network",
        about = "Compute a circular ordering and non-negative split weights from a distance matrix"
    )]
    Network(NetworkArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NetworkArgs {
    /// Input distance matrix file path
    #[arg(short, long, help = "Input distance matrix file path", required = true)]
    pub input: String,
    #[arg(
        short,
        long,
        help = "Output prefix for result files",
        default_value = "output"
    )]
    pub output_prefix: String,
    #[arg(
        short = 'O',
        long,
        help = "The ordering algorithm to use to get the splits cycle",
        default_value = "agglomerative"
    )]
    pub ordering: OrderingMethod,
    #[clap(flatten)]
    pub nnls_params: NNLSParams,
}

impl Default for NetworkArgs {
    fn default() -> Self {
        Self {
            input: String::new(),
            output_prefix: String::from("output"),
            ordering: OrderingMethod::Agglomerative,
            nnls_params: NNLSParams::default(),
        }
    }
}
