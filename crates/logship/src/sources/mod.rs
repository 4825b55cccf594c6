// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod directory;
pub mod parser;

use std::sync::Arc;

use crate::pipeline::EventSource;
use crate::plugin::PluginRegistry;
use directory::{DirectorySource, DIRECTORY_SOURCE_TYPE};

pub fn register(registry: &mut PluginRegistry) {
    registry.register_source(DIRECTORY_SOURCE_TYPE, |section, context| {
        let source = DirectorySource::from_section(section, context)?;
        Ok(Arc::new(source) as Arc<dyn EventSource>)
    });
}
