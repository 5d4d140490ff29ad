// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

/// Key for maximum number of rows per output page
pub static OPTION_KEY_BATCH_SIZE: &str = "batch_size";
/// Key for maximum estimated bytes per output page
pub static OPTION_KEY_MAX_PAGE_BYTES: &str = "max_page_bytes";
/// Key for the minimum selection strategy, one of `linear`, `heap`, `auto`
pub static OPTION_KEY_MERGE_STRATEGY: &str = "merge_strategy";
/// Key for the fan-in above which `auto` switches to the heap strategy
pub static OPTION_KEY_HEAP_FAN_IN_THRESHOLD: &str = "heap_fan_in_threshold";
