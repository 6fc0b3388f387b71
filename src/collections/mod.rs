// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod watched;

pub use watched::WatchedValue;
