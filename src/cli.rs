// CLI definitions using clap

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chromad")]
#[command(author, version, about = "Razer Chroma RGB peripheral daemon")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List connected devices
    #[command(visible_alias = "ls")]
    List,

    /// Show details for one or all devices
    #[command(visible_alias = "i")]
    Info {
        /// Device key (vendor:product.index); all devices when omitted
        key: Option<String>,
    },

    /// Run the daemon with hot-plug monitoring until interrupted
    #[command(visible_alias = "d")]
    Daemon,

    /// Activate a firmware lighting effect
    #[command(visible_alias = "fx")]
    SetFx {
        /// Effect name (e.g. static, wave, spectrum, breathe)
        name: String,

        /// Primary color, as #rrggbb or a color name
        #[arg(short, long)]
        color: Option<String>,

        /// Device key; first device when omitted
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Get or set the lighting brightness (0-100)
    #[command(visible_alias = "b")]
    Brightness {
        /// Target level; prints the current level when omitted
        level: Option<f64>,

        /// Device key; first device when omitted
        #[arg(short, long)]
        device: Option<String>,
    },
}
