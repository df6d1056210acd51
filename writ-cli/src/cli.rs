use std::path::PathBuf;

use anyhow::bail;
use writ::Writ;
use writ_core::formatting::ToPolicy;

/// Command line arguments: `writ [--query <q>] <file.writ>...`
#[derive(Debug, Default, PartialEq)]
pub struct Args {
    pub query: Option<String>,
    pub files: Vec<PathBuf>,
}

impl Args {
    pub fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-q" | "--query" => match args.next() {
                    Some(query) if parsed.query.is_none() => parsed.query = Some(query),
                    Some(_) => bail!("--query given more than once"),
                    None => bail!("--query needs a value"),
                },
                flag if flag.starts_with('-') => bail!("unknown option {}", flag),
                _ => parsed.files.push(PathBuf::from(arg)),
            }
        }
        Ok(parsed)
    }
}

/// Load the policy files, which also runs their inline queries, then run
/// the query if there is one.
pub fn run(args: &Args) -> anyhow::Result<()> {
    let mut writ = Writ::new();
    for file in &args.files {
        tracing::info!("Loading: {}", file.display());
    }
    writ.load_files(args.files.clone())?;

    let query = match &args.query {
        Some(query) => query,
        None => return Ok(()),
    };

    let mut found = false;
    for result in writ.query(query)? {
        let result = result?;
        found = true;
        if result.is_empty() {
            println!("True");
            continue;
        }
        let mut bindings: Vec<_> = result
            .iter_bindings()
            .map(|(name, value)| format!("{} = {}", name, value.to_policy()))
            .collect();
        bindings.sort();
        println!("{}", bindings.join(", "));
    }
    if !found {
        println!("False");
    }
    Ok(())
}
