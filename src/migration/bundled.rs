use super::StaticSource;

macro_rules! bundle {
    ($($file:literal),* $(,)?) => {
        [$(($file, include_str!(concat!("../../migrations/", $file)))),*]
    };
}

/// The tracker schema compiled into the binary, used when no migrations
/// directory is configured.
pub fn bundled() -> StaticSource {
    StaticSource::new(bundle![
        "0001_create_users.sql",
        "0002_create_accountability_checkins.sql",
        "0003_create_feat_completions.sql",
        "0004_create_weigh_ins.sql",
        "0005_add_finances_tracking.sql",
        "0006_add_autopopulated_columns.sql",
        "0007_auto_populate_trigger.sql",
    ])
}
