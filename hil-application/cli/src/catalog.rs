//! 演示序列目录

use anyhow::Result;
use hil_flow::{FatalErrorStep, NoopStep, RunErrorStep, Sequence, SequenceCatalog, SleepStep, Tag};
use std::time::Duration;

/// 固件相关标签
pub mod fw_tags {
    use super::Tag;

    pub fn front_controller_flashed() -> Tag {
        Tag::new("FW001", "front controller flashed")
    }

    pub fn tms_flashed() -> Tag {
        Tag::new("FW002", "tms flashed")
    }
}

fn sleep(secs: u64) -> SleepStep {
    SleepStep::new(Duration::from_secs(secs))
        .with_result(fw_tags::front_controller_flashed(), true)
        .with_result(fw_tags::tms_flashed(), true)
}

fn do_nothing() -> Sequence {
    (0..12).fold(
        Sequence::new("do-nothing", "wow... it does nothing"),
        |seq, _| seq.with_step(NoopStep::new()),
    )
}

fn sleeper() -> Sequence {
    Sequence::new("sleeper", "zzz")
        .with_step(sleep(1))
        .with_step(sleep(5))
        .with_step(sleep(1))
        .with_step(sleep(2))
}

fn fatal_error() -> Sequence {
    Sequence::new("fatal-error", "this one fails fatally")
        .with_step(sleep(2))
        .with_step(sleep(3))
        .with_step(sleep(1))
        .with_step(
            FatalErrorStep::new()
                .with_result(fw_tags::front_controller_flashed(), true)
                .with_result(fw_tags::tms_flashed(), true),
        )
        .with_step(sleep(2))
        .with_step(sleep(3))
}

fn normal_error() -> Sequence {
    Sequence::new("normal-error", "one step fails, the rest keep going")
        .with_step(sleep(2))
        .with_step(sleep(3))
        .with_step(
            RunErrorStep::new()
                .with_result(fw_tags::front_controller_flashed(), true)
                .with_result(fw_tags::tms_flashed(), true),
        )
        .with_step(sleep(2))
        .with_step(sleep(3))
}

/// 内置的演示序列
pub fn demo_catalog() -> Result<SequenceCatalog> {
    let mut catalog = SequenceCatalog::new();
    catalog.register(do_nothing)?;
    catalog.register(sleeper)?;
    catalog.register(fatal_error)?;
    catalog.register(normal_error)?;
    Ok(catalog)
}
