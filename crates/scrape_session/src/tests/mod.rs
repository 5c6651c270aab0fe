use super::*;
use std::sync::Arc;
use std::time::Duration;
use tail_events::EventStream;

mod support;
use support::*;
