/*
 * Copyright 2020 Damian Peckett <damian@pecke.tt>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::metrics::UtilizationReading;
use crate::strategy::threshold::ThresholdAutoScalerStrategy;
use enum_dispatch::enum_dispatch;

/// Single threshold autoscaling strategy implementation.
pub mod threshold;

/// What the control loop should do about a reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalingDecision {
    NoAction,
    ScaleUp,
}

/// Autoscaling strategies / control algorithms.
#[enum_dispatch]
#[derive(Clone, Debug)]
pub enum AutoScalerStrategy {
    Threshold(ThresholdAutoScalerStrategy),
}

/// Autoscaling strategy trait.
#[enum_dispatch(AutoScalerStrategy)]
pub trait AutoScalerStrategyTrait {
    /// Decide what to do given the latest utilization reading.
    fn evaluate(&self, reading: &UtilizationReading) -> ScalingDecision;
}
