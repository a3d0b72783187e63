//! Experiment grid and run naming.

use planact_core::{loss_divider_pairs, LossDividerMethod, PlanActConfig, Result};
use serde::Serialize;

/// Depth of the reference model.
pub const REFERENCE_DEPTH: usize = 1;

/// One model and loss-divider combination. Every setting runs `num_runs`
/// times with the same seeds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Setting {
    pub depth: usize,
    pub width: usize,
    pub planning_divider: f64,
    pub acting_divider: f64,
}

/// Cross every width with every divider pair.
///
/// Without plan-act a single `(0, 0)` divider pair is used.
pub fn build_settings(
    widths: &[usize],
    plan_act: bool,
    planning_dividers: &[f64],
    acting_dividers: &[f64],
    method: LossDividerMethod,
) -> Result<Vec<Setting>> {
    let pairs = if plan_act {
        loss_divider_pairs(planning_dividers, acting_dividers, method)?
    } else {
        vec![(0.0, 0.0)]
    };

    Ok(widths
        .iter()
        .flat_map(|&width| {
            pairs.iter().map(move |&(planning_divider, acting_divider)| Setting {
                depth: REFERENCE_DEPTH,
                width,
                planning_divider,
                acting_divider,
            })
        })
        .collect())
}

/// `depth_{d}_width_{w}_seed_{s}`, prefixed with the plan-act settings when
/// the curriculum is on.
pub fn run_name(setting: &Setting, seed: u64, plan_act: &PlanActConfig) -> String {
    let mut name = format!(
        "depth_{}_width_{}_seed_{}",
        setting.depth, setting.width, seed
    );
    if plan_act.enabled {
        if plan_act.randomize_masking_rate {
            name = format!("randomize_masking_rate_{name}");
        }
        name = format!(
            "plan-act_loss-dividers-P-A_{:?}-{:?}_top_k_{}_{name}",
            setting.planning_divider, setting.acting_divider, plan_act.top_k
        );
    }
    name
}

/// Human-readable listing for `--review-settings`.
pub fn describe(settings: &[Setting], plan_act: &PlanActConfig) -> String {
    let mut out = String::new();
    for (index, setting) in settings.iter().enumerate() {
        out.push_str(&format!(
            "Setting {}/{}:\n  depth={}\n  width={}\n  plan_act={}\n",
            index + 1,
            settings.len(),
            setting.depth,
            setting.width,
            plan_act.enabled
        ));
        if plan_act.enabled {
            out.push_str(&format!(
                "  planning_divider={}\n  acting_divider={}\n  randomize_masking_rate={}\n  top_k={}\n",
                setting.planning_divider,
                setting.acting_divider,
                plan_act.randomize_masking_rate,
                plan_act.top_k
            ));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_act(enabled: bool, randomize: bool) -> PlanActConfig {
        PlanActConfig {
            enabled,
            randomize_masking_rate: randomize,
            top_k: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_causal_grid_uses_zero_dividers() {
        let settings =
            build_settings(&[64, 128], false, &[2.0, 3.0], &[1.0], LossDividerMethod::Zip).unwrap();
        assert_eq!(settings.len(), 2);
        assert!(settings
            .iter()
            .all(|s| s.planning_divider == 0.0 && s.acting_divider == 0.0));
    }

    #[test]
    fn test_product_and_zip() {
        let product =
            build_settings(&[64], true, &[1.0, 2.0], &[1.0, 4.0, 8.0], LossDividerMethod::Product)
                .unwrap();
        assert_eq!(product.len(), 6);

        let zip =
            build_settings(&[64, 32], true, &[1.0, 2.0], &[4.0, 8.0], LossDividerMethod::Zip).unwrap();
        let pairs: Vec<_> = zip
            .iter()
            .map(|s| (s.width, s.planning_divider, s.acting_divider))
            .collect();
        assert_eq!(
            pairs,
            vec![(64, 1.0, 4.0), (64, 2.0, 8.0), (32, 1.0, 4.0), (32, 2.0, 8.0)]
        );

        let err = build_settings(&[64], true, &[1.0, 2.0], &[4.0], LossDividerMethod::Zip).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_run_names() {
        let setting = Setting {
            depth: 1,
            width: 64,
            planning_divider: 2.0,
            acting_divider: 0.5,
        };
        assert_eq!(
            run_name(&setting, 7, &plan_act(false, true)),
            "depth_1_width_64_seed_7"
        );
        assert_eq!(
            run_name(&setting, 7, &plan_act(true, false)),
            "plan-act_loss-dividers-P-A_2.0-0.5_top_k_3_depth_1_width_64_seed_7"
        );
        assert_eq!(
            run_name(&setting, 7, &plan_act(true, true)),
            "plan-act_loss-dividers-P-A_2.0-0.5_top_k_3_randomize_masking_rate_depth_1_width_64_seed_7"
        );
    }

    #[test]
    fn test_describe_lists_every_setting() {
        let settings =
            build_settings(&[64], true, &[1.0, 2.0], &[1.0, 2.0], LossDividerMethod::Zip).unwrap();
        let text = describe(&settings, &plan_act(true, false));
        assert!(text.contains("Setting 1/2"));
        assert!(text.contains("Setting 2/2"));
        assert!(text.contains("planning_divider=2"));
    }
}
