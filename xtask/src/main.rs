use std::process;

use clap::{Command, crate_authors, crate_description, crate_name, crate_version};

use xtask::manifests;

fn main() {
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommand(
            Command::new("manifests")
                .about("generate the ResourceGraphDefinition CRD manifest into config/crd"),
        );

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("manifests", _)) => manifests::command(),
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}
