//! Build automation tasks for pgfan
//!
//! - Generating the CLI reference from the clap definitions

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for pgfan", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<pgfan_cli::Cli>();

    let content = format!(
        r#"# pgfan CLI Reference

This documentation is generated from the CLI source code. Last updated: {}.

## Overview

pgfan runs one SQL query against many PostgreSQL databases at the same time
and writes every result set into a single zip archive, one CSV entry per
database named `<host>_<database>.csv`.

```bash
pgfan -q "SELECT count(*) FROM orders" -o orders.zip \
  postgres://report@eu-1/shop postgres://report@us-1/shop
```

{}

## Environment Variables

- `PGFAN_QUERY`, `PGFAN_OUTPUT`, `PGFAN_CONNECT_TIMEOUT`,
  `PGFAN_MAX_CONCURRENCY`, `PGFAN_ON_COLLISION` - defaults for the matching flags
- `PGFAN_REFRESH_MS` - status display refresh interval (default: 166)
- `PGFAN_TEMP_DIR` - directory for per-endpoint temporary files
- `DEBUG` - when set, write debug diagnostics to `./debug.log`
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILE`, `LOG_FILTER` - full logging control

## Exit Codes

| Code | Meaning |
|------|---------|
| 0 | Archive written (some endpoints may have failed) |
| 1 | Invalid endpoint, rejected name collision, or archive could not be written |
| 2 | Usage error |
| 130 | Cancelled with Ctrl-C; no archive was written |

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("✅ Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
