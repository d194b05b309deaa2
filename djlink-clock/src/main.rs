use std::process::exit;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use djlink::{
    BeatNotes, BpmSource, Config, DjLink, Event, EventKindSet, LinkError, MidiClockConfig,
    MidirSink, NullSink, TrackSlot,
};

/// MIDI clock generator locked to a ProDJ Link network.
#[derive(Parser, Debug)]
#[command(name = "djlink-clock")]
#[command(about = "Emit a 24 PPQN MIDI clock following the network tempo master")]
struct Args {
    /// Network interface to bind (default: first broadcast-capable)
    #[arg(long)]
    iface: Option<String>,

    /// Player number to claim (default: lowest free)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=4))]
    device_number: Option<u8>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: String,

    /// MIDI output port, matched as a substring (default: first port)
    #[arg(long)]
    midi_port: Option<String>,

    /// List available MIDI output ports and exit
    #[arg(short = 'l', long)]
    list_ports: bool,

    /// Send four different note-on events depending on the beat
    #[arg(short = 'n', long, conflicts_with = "single_note")]
    notes: bool,

    /// Send the same note-on event on every beat
    #[arg(short = 's', long)]
    single_note: bool,

    /// Note value for the first beat
    #[arg(long, default_value_t = 60)]
    note_base: u8,

    /// MIDI channel for beat notes (0-15)
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=15))]
    channel: u8,

    /// Follow this player's tempo instead of the network master
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=4))]
    pin: Option<u8>,

    /// Name announced on the network
    #[arg(long, default_value = "djlink-clock")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    if args.list_ports {
        match DjLink::midi_ports() {
            Ok(ports) if ports.is_empty() => info!("no midi output ports found"),
            Ok(ports) => {
                info!("available midi output ports:");
                for (i, name) in ports.iter().enumerate() {
                    info!("  port {}: {}", i, name);
                }
            }
            Err(e) => warn!("can't list midi ports: {}", e),
        }
        return Ok(());
    }

    let sink: Box<dyn djlink::MidiSink> = match MidirSink::connect(args.midi_port.as_deref()) {
        Ok(sink) => Box::new(sink),
        Err(e) => {
            warn!("midi output unavailable ({}), running silent", e);
            Box::new(NullSink)
        }
    };

    let mut link = match DjLink::join(Config {
        name: args.name.clone(),
        device_num: args.device_number,
        interface_name: args.iface.clone(),
    })
    .await
    {
        Ok(link) => link,
        Err(e @ LinkError::Interface(_)) => {
            log::error!("{}", e);
            exit(2);
        }
        Err(e @ LinkError::DeviceNumberConflict(_)) => {
            log::error!("{}", e);
            exit(3);
        }
        Err(e) => return Err(e.into()),
    };
    info!("joined as player {}", link.device_num());

    if let Some(pin) = args.pin {
        link.set_bpm_source(BpmSource::Pin(pin)).await?;
    }

    let beat_notes = if args.notes {
        BeatNotes::PerBeat
    } else if args.single_note {
        BeatNotes::Single
    } else {
        BeatNotes::Off
    };
    let clock = link.start_midi_clock(
        sink,
        MidiClockConfig {
            beat_notes,
            note_base: args.note_base,
            channel: args.channel,
        },
    );
    clock.start().await?;

    let mut events = link.subscribe(EventKindSet::all()).await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            event = events.next() => {
                match event {
                    Some(event) => print_event(&link, event),
                    None => break,
                }
            }
        }
    }

    info!("shutting down");
    let _ = clock.stop().await;
    link.terminate().await;
    Ok(())
}

fn print_event(link: &DjLink, event: Event) {
    match event {
        Event::DeviceFound(device) => {
            info!(
                "found {} ({:?}) as device {}",
                device.name, device.kind, device.device_num
            );
        }
        Event::DeviceLost(num) => info!("lost device {}", num),
        Event::MasterChanged { from, to } => {
            info!("tempo master {:?} -> {:?}", from, to);
        }
        Event::TrackLoaded { device_num, track } => {
            info!(
                "player {} loaded track {} from {}/{:?}",
                device_num,
                track.track_id,
                track.source_device,
                slot_name(track.slot)
            );
        }
        Event::Play(num) => info!("player {} playing", num),
        Event::Stop(num) => info!("player {} stopped", num),
        Event::Cue(num) => info!("player {} cued", num),
        Event::ClockSourceChanged { stale, resync } => {
            let snapshot = link.snapshot();
            if stale {
                warn!(
                    "tempo source silent, coasting at {:?}",
                    snapshot.clock.bpm_centi
                );
            } else if resync {
                info!("clock resynced to the beat grid");
            }
        }
        Event::MidiUnderrun { total } => warn!("midi underruns: {}", total),
        Event::Beat { .. } | Event::PlayerUpdate(_) => {}
    }
}

fn slot_name(slot: TrackSlot) -> &'static str {
    match slot {
        TrackSlot::Cd => "cd",
        TrackSlot::Sd => "sd",
        TrackSlot::Usb => "usb",
        TrackSlot::RekordboxCollection => "rekordbox",
    }
}
