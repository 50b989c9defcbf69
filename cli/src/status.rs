use dfu::{DfuFilter, Selection, discover, status_description};

use crate::{
    CliError,
    list::{print_segment, print_targets},
};

pub(crate) async fn show_status(filter: &DfuFilter) -> Result<(), CliError> {
    let target = match discover(filter).await? {
        Selection::NotFound => return Err(CliError::NoDFUDevice),
        Selection::Ambiguous(targets) => {
            print_targets(&targets);
            return Err(CliError::ManyDFUDevices);
        }
        Selection::Found(target) => target,
    };

    let mut connection = target.connect().await?;
    println!("{}", connection.summary());
    if let Some(desc) = connection.descriptor() {
        println!("{desc}");
    }
    if let Some(memory) = connection.memory() {
        println!("{}:", memory.name);
        for segment in &memory.segments {
            print_segment("  ", segment);
        }
    }

    let result = connection.get_status().await;
    connection.close();
    let st = result?;
    println!(
        "State: {}, status: {} ({})",
        st.state(),
        st.status(),
        status_description(st.status())
    );
    Ok(())
}
