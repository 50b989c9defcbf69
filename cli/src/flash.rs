use std::{
    io::{self, Write},
    path::Path,
};

use dfu::CancelToken;
use dfu_flash::{FlashOptions, FlashOutcome, flash_firmware};

use crate::{CliError, list::print_targets};

pub(crate) async fn flash_file(
    file: &Path,
    options: &FlashOptions,
) -> Result<(), CliError> {
    let data = std::fs::read(file)?;
    println!("Flashing {} ({} bytes)", file.display(), data.len());

    let cancel = CancelToken::new();
    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = flash_firmware(&data, options, &cancel, print_progress).await;
    signal.abort();
    println!();

    match result? {
        FlashOutcome::NoDevice => Err(CliError::NoDFUDevice),
        FlashOutcome::Ambiguous(targets) => {
            print_targets(&targets);
            Err(CliError::ManyDFUDevices)
        }
        FlashOutcome::Flashed { bytes } => {
            println!("Done, {bytes} bytes written");
            Ok(())
        }
    }
}

fn print_progress(bytes_done: usize, bytes_total: usize) {
    let percentage = (100 * bytes_done) / bytes_total;
    let filled = (60 * bytes_done) / bytes_total;
    print!(
        "\r  Flashing {:3}% [{}]",
        percentage,
        "#".repeat(filled) + &" ".repeat(60 - filled)
    );
    let _ = io::stdout().flush();
}
