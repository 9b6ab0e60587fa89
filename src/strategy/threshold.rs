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
use crate::strategy::{AutoScalerStrategyTrait, ScalingDecision};

/// Scale up by one instance whenever utilization is above a threshold.
#[derive(Clone, Debug)]
pub struct ThresholdAutoScalerStrategy {
    threshold: f64,
}

impl ThresholdAutoScalerStrategy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl AutoScalerStrategyTrait for ThresholdAutoScalerStrategy {
    fn evaluate(&self, reading: &UtilizationReading) -> ScalingDecision {
        decide(reading.value, self.threshold)
    }
}

/// Strictly above the threshold scales up, equality does not.
pub fn decide(reading: f64, threshold: f64) -> ScalingDecision {
    if reading > threshold {
        ScalingDecision::ScaleUp
    } else {
        ScalingDecision::NoAction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::AutoScalerStrategy;

    #[test]
    fn test_decide() {
        assert_eq!(decide(80.0, 75.0), ScalingDecision::ScaleUp);
        assert_eq!(decide(75.01, 75.0), ScalingDecision::ScaleUp);
        assert_eq!(decide(75.0, 75.0), ScalingDecision::NoAction);
        assert_eq!(decide(50.0, 75.0), ScalingDecision::NoAction);
        assert_eq!(decide(0.0, 0.0), ScalingDecision::NoAction);
        // Measurement error can push a reading past 100%.
        assert_eq!(decide(101.3, 75.0), ScalingDecision::ScaleUp);
    }

    #[test]
    fn test_decide_is_idempotent() {
        for reading in [0.0, 74.99, 75.0, 75.01, 100.0] {
            assert_eq!(decide(reading, 75.0), decide(reading, 75.0));
        }
    }

    #[test]
    fn test_threshold_strategy() {
        let strategy = AutoScalerStrategy::Threshold(ThresholdAutoScalerStrategy::new(75.0));

        assert_eq!(
            strategy.evaluate(&UtilizationReading::new(80.0)),
            ScalingDecision::ScaleUp
        );
        assert_eq!(
            strategy.evaluate(&UtilizationReading::new(75.0)),
            ScalingDecision::NoAction
        );
        assert_eq!(
            strategy.evaluate(&UtilizationReading::neutral()),
            ScalingDecision::NoAction
        );
    }
}
