use dfu::{
    DfuDevice, DfuMemSegment, DfuTarget, find_dfu_devices, parse_memory_layout,
};

use crate::CliError;

pub(crate) async fn list_dfu_devices(vid: Option<u16>) -> Result<(), CliError> {
    let mut devices = find_dfu_devices(vid, None).await?;
    if devices.is_empty() {
        println!("No DFU device found");
        return Ok(());
    }
    for device in devices.iter_mut() {
        if let Err(err) = device.fix_interface_names().await {
            log::warn!("Unable to read interface names: {err}");
        }
    }
    print_devices(&devices).await;
    Ok(())
}

/// Short form used when a filter matched more than one interface
pub(crate) fn print_targets(targets: &[DfuTarget]) {
    for target in targets {
        let device = target.device();
        let intf = target.interface();
        println!(
            "  [{:04x}:{:04x}] serial=\"{}\" intf={}, alt={}, name=\"{}\"",
            device.vendor_id(),
            device.product_id(),
            device.serial_number().unwrap_or(""),
            intf.interface(),
            intf.alt_setting(),
            intf.name().unwrap_or(""),
        );
    }
}

pub(crate) fn print_segment(prefix: &str, segment: &DfuMemSegment) {
    let mut page_size = segment.page_size();
    let page_char = if page_size >= 1024 {
        page_size /= 1024;
        "K"
    } else {
        " "
    };
    println!(
        "{}0x{:08X} {:2} pages of {:4}{} bytes ({}{}{})",
        prefix,
        segment.start_addr(),
        segment.pages(),
        page_size,
        page_char,
        if segment.readable() { "r" } else { "" },
        if segment.writable() { "w" } else { "" },
        if segment.erasable() { "e" } else { "" },
    );
}

async fn print_devices(devices: &[DfuDevice]) {
    for device in devices {
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x} serial=\"{}\" (dfuse={})",
            device.bus_id(),
            device.device_address(),
            device.vendor_id(),
            device.product_id(),
            device.serial_number().unwrap_or(""),
            device.is_dfuse().await,
        );

        for interface in device.interfaces() {
            let name = interface.name().unwrap_or("");
            match parse_memory_layout(name) {
                Ok(layout) => {
                    println!(
                        "  {} (cfg={}, intf={}, alt={}):",
                        layout.name,
                        interface.config(),
                        interface.interface(),
                        interface.alt_setting(),
                    );
                    for segment in &layout.segments {
                        print_segment("    ", segment);
                    }
                }
                Err(_) => println!(
                    "  \"{}\" (cfg={}, intf={}, alt={})",
                    name,
                    interface.config(),
                    interface.interface(),
                    interface.alt_setting(),
                ),
            }
        }
    }
}
