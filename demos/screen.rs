//! Screen reader - prints what the K2 front panel shows.
//!
//! This example demonstrates:
//! - Connecting to a K2 over a named MIDI port pair
//! - Reading the text layer and the graphics layer
//! - Navigating with front panel buttons
//!
//! # Running
//!
//! ```sh
//! cargo run --example screen --features midi -- "K2600"
//! ```
//!
//! The argument is matched as a substring against the MIDI port names.

use k2_client::transport::midi;
use k2_client::Session;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port = match std::env::args().nth(1) {
        Some(port) => port,
        None => {
            eprintln!("usage: screen <port name>");
            eprintln!("inputs:  {:?}", midi::input_port_names()?);
            eprintln!("outputs: {:?}", midi::output_port_names()?);
            return Ok(());
        }
    };

    let session = Session::connect(&port).await?;
    if !session.is_connected() {
        eprintln!("No answer from a K2 on {}", port);
        return Ok(());
    }

    // Jump to Program mode and show the current program
    session.program().await?;
    println!("{}", session.screen_text().await?);

    let raster = session.screenshot().await?;
    println!(
        "Graphics layer: {}x{}, {} pixels lit",
        raster.width(),
        raster.height(),
        raster.lit_count()
    );

    println!(
        "Cursor on {} = {}",
        session.parameter_name().await?,
        session.parameter_value().await?
    );

    session.close();
    Ok(())
}
