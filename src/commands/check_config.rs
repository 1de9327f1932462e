use anyhow::Result;
use skywatch::config::TrackerFileConfig;
use std::path::Path;

/// Load, validate and summarise a tracker config without starting anything
pub fn handle_check_config(config_path: &Path) -> Result<()> {
    let file = TrackerFileConfig::load(config_path)?;
    let tracker = file.tracker_config()?;

    println!("{}: OK", config_path.display());
    println!(
        "  workers={} timeout={}s sweep={}s confirmations={} geocode_max_altitude={}ft",
        tracker.workers,
        tracker.sighting_timeout.num_seconds(),
        tracker.sweep_interval.as_secs(),
        tracker.on_ground_confirmations,
        tracker.geocode_max_altitude_ft
    );
    match &file.geocoder {
        Some(geocoder) => println!("  geocoder: {}", geocoder.base_url),
        None => println!("  geocoder: disabled"),
    }
    println!(
        "  email: {}",
        if file.email.enabled { "enabled" } else { "disabled" }
    );

    for (section, definition) in file.projects.iter().zip(file.project_definitions()?) {
        let mut features: Vec<String> = definition.features.iter().map(|f| f.to_string()).collect();
        features.sort();
        let mut notifications: Vec<String> = definition
            .notifications
            .iter()
            .map(|n| n.to_string())
            .collect();
        notifications.sort();

        println!("  project '{}'", definition.name);
        if let Some(filter) = &section.filter {
            println!("    filter: {}", filter);
        }
        println!("    features: {}", features.join(", "));
        println!("    notifications: {}", notifications.join(", "));
        println!("    recipients: {}", definition.recipients.len());
        if definition.reopen.enabled {
            println!(
                "    reopen within {}s",
                definition.reopen.interval.num_seconds()
            );
        } else {
            println!("    reopen disabled");
        }
    }

    Ok(())
}
