//! Detection parameters and the editable form that produces them.
//!
//! Each form field is one of a small closed set of value kinds (number,
//! choice, table) behind a common `get`/`set`. `ParamForm::get_args` reads
//! every field and reports all invalid ones together.

use anyhow::{bail, Result};

use crate::error::SetupError;
use crate::freqs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NumericalMethod {
    RungeKutta,
    CentralDifference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FreqNorm {
    Unnormalized,
    SearchNormalized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AmpNorm {
    Unnormalized,
    Normalized,
}

pub const METHOD_LABELS: [&str; 2] = ["Fourth order Runge-Kutta", "Central difference"];
pub const FREQ_NORM_LABELS: [&str; 2] = ["Unnormalized", "Search normalized"];
pub const AMP_NORM_LABELS: [&str; 2] = ["Unnormalized", "Normalized"];

const SAMPLE_RATE_NAME: &str = "Sample rate";
const DET_CHARS_NAME: &str = "Frequencies and bandwidths";
const DAMPING_NAME: &str = "Damping";
const GAIN_NAME: &str = "Gain";

/// Numerical method, frequency normalization and amplitude normalization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Features {
    pub method: NumericalMethod,
    pub freq_norm: FreqNorm,
    pub amp_norm: AmpNorm,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            method: NumericalMethod::RungeKutta,
            freq_norm: FreqNorm::Unnormalized,
            amp_norm: AmpNorm::Unnormalized,
        }
    }
}

impl Features {
    /// Comma separated form used in saved profiles.
    pub fn to_feature_set(&self) -> String {
        let method = match self.method {
            NumericalMethod::RungeKutta => "Runge-Kutta method",
            NumericalMethod::CentralDifference => "Central difference method",
        };
        let freq = match self.freq_norm {
            FreqNorm::Unnormalized => "Frequency unnormalized",
            FreqNorm::SearchNormalized => "Search-normalized",
        };
        let amp = match self.amp_norm {
            AmpNorm::Unnormalized => "Amplitude unnormalized",
            AmpNorm::Normalized => "Amplitude normalized",
        };
        format!("{method},{freq},{amp}")
    }

    pub fn parse_feature_set(text: &str) -> Result<Self> {
        let mut features = Features::default();
        let mut seen = 0;
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item {
                "Runge-Kutta method" => features.method = NumericalMethod::RungeKutta,
                "Central difference method" => features.method = NumericalMethod::CentralDifference,
                "Frequency unnormalized" => features.freq_norm = FreqNorm::Unnormalized,
                "Search-normalized" => features.freq_norm = FreqNorm::SearchNormalized,
                "Amplitude unnormalized" => features.amp_norm = AmpNorm::Unnormalized,
                "Amplitude normalized" => features.amp_norm = AmpNorm::Normalized,
                other => bail!("unknown feature '{}'", other),
            }
            seen += 1;
        }
        if seen != 3 {
            bail!("expected 3 features, found {} in '{}'", seen, text);
        }
        Ok(features)
    }

    fn from_choices(method: usize, freq_norm: usize, amp_norm: usize) -> Self {
        Self {
            method: if method == 0 { NumericalMethod::RungeKutta } else { NumericalMethod::CentralDifference },
            freq_norm: if freq_norm == 0 { FreqNorm::Unnormalized } else { FreqNorm::SearchNormalized },
            amp_norm: if amp_norm == 0 { AmpNorm::Unnormalized } else { AmpNorm::Normalized },
        }
    }

    fn choice_indices(&self) -> (usize, usize, usize) {
        (
            (self.method == NumericalMethod::CentralDifference) as usize,
            (self.freq_norm == FreqNorm::SearchNormalized) as usize,
            (self.amp_norm == AmpNorm::Normalized) as usize,
        )
    }
}

/// Target frequency (Hz) and bandwidth (Hz) of one detector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectorChar {
    pub freq: f64,
    pub bandwidth: f64,
}

impl DetectorChar {
    pub fn new(freq: f64, bandwidth: f64) -> Self {
        Self { freq, bandwidth }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorParams {
    pub sample_rate: f64,
    pub num_threads: usize,
    pub det_chars: Vec<DetectorChar>,
    pub damping: f64,
    pub gain: f64,
    pub features: Features,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            num_threads: default_threads(),
            det_chars: freqs::semitones(-48, 40)
                .into_iter()
                .map(|f| DetectorChar::new(f, 0.0))
                .collect(),
            damping: 0.0001,
            gain: 25.0,
            features: Features::default(),
        }
    }
}

impl DetectorParams {
    pub fn frequencies(&self) -> Vec<f64> {
        self.det_chars.iter().map(|c| c.freq).collect()
    }

    /// Check every field, then the cross-field rules.
    ///
    /// All invalid fields are reported together, named as in the form.
    pub fn validate(&self) -> Result<(), SetupError> {
        let mut invalid = Vec::new();
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            invalid.push(SAMPLE_RATE_NAME.to_string());
        }
        let table_ok = !self.det_chars.is_empty()
            && self.det_chars.iter().all(|c| {
                c.freq.is_finite() && c.freq > 0.0 && c.bandwidth.is_finite() && c.bandwidth >= 0.0
            });
        if !table_ok {
            invalid.push(DET_CHARS_NAME.to_string());
        }
        if !(self.damping.is_finite() && self.damping >= 0.0) {
            invalid.push(DAMPING_NAME.to_string());
        }
        if !(self.gain.is_finite() && self.gain >= 0.0) {
            invalid.push(GAIN_NAME.to_string());
        }
        if !invalid.is_empty() {
            return Err(SetupError::InvalidArgs { fields: invalid });
        }

        if self.features.method == NumericalMethod::CentralDifference
            && self.det_chars.iter().any(|c| c.bandwidth != 0.0)
        {
            return Err(SetupError::IncompatibleMethod);
        }
        Ok(())
    }
}

pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Value carried by a form field.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Number(f64),
    Choice(usize),
    Table(Vec<DetectorChar>),
}

/// Editable field kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Number { value: Option<f64>, integer: bool },
    Choice { options: &'static [&'static str], selected: Option<usize> },
    Table(Option<Vec<DetectorChar>>),
}

impl ParamValue {
    pub fn number(value: f64) -> Self {
        ParamValue::Number { value: Some(value), integer: false }
    }

    pub fn integer(value: usize) -> Self {
        ParamValue::Number { value: Some(value as f64), integer: true }
    }

    pub fn choice(options: &'static [&'static str], selected: usize) -> Self {
        ParamValue::Choice { options, selected: Some(selected) }
    }

    /// Current value, or `None` if unset or invalid.
    pub fn get(&self) -> Option<Value> {
        match self {
            ParamValue::Number { value, integer } => {
                let v = (*value)?;
                if !v.is_finite() || (*integer && v.fract() != 0.0) {
                    return None;
                }
                Some(Value::Number(v))
            }
            ParamValue::Choice { options, selected } => {
                selected.filter(|&i| i < options.len()).map(Value::Choice)
            }
            ParamValue::Table(table) => table
                .as_ref()
                .filter(|t| !t.is_empty())
                .map(|t| Value::Table(t.clone())),
        }
    }

    /// Store `value`. Returns false if the kind does not match.
    pub fn set(&mut self, value: Value) -> bool {
        match (self, value) {
            (ParamValue::Number { value, .. }, Value::Number(v)) => *value = Some(v),
            (ParamValue::Choice { options, selected }, Value::Choice(i)) => {
                if i >= options.len() {
                    return false;
                }
                *selected = Some(i);
            }
            (ParamValue::Table(table), Value::Table(t)) => *table = Some(t),
            _ => return false,
        }
        true
    }

    /// Set from user-entered text; unparsable numbers leave the field unset.
    pub fn set_text(&mut self, text: &str) -> bool {
        match self {
            ParamValue::Number { value, .. } => {
                *value = text.trim().parse::<f64>().ok();
                true
            }
            ParamValue::Choice { options, selected } => match options.iter().position(|o| *o == text) {
                Some(i) => {
                    *selected = Some(i);
                    true
                }
                None => false,
            },
            ParamValue::Table(_) => false,
        }
    }

    pub fn clear(&mut self) {
        match self {
            ParamValue::Number { value, .. } => *value = None,
            ParamValue::Choice { selected, .. } => *selected = None,
            ParamValue::Table(table) => *table = None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Param {
    pub key: &'static str,
    pub name: &'static str,
    pub tooltip: &'static str,
    pub value: ParamValue,
}

/// Detection parameter form with profile bookkeeping.
#[derive(Clone, Debug)]
pub struct ParamForm {
    params: Vec<Param>,
    current_profile: Option<String>,
    altered: bool,
}

impl Default for ParamForm {
    fn default() -> Self {
        Self {
            params: vec![
                Param { key: "sr", name: SAMPLE_RATE_NAME, tooltip: "Sample rate of audio file", value: ParamValue::number(48000.0) },
                Param {
                    key: "numThreads",
                    name: "Threads",
                    tooltip: "Maximum number of threads to execute concurrently to determine the detector outputs",
                    value: ParamValue::integer(default_threads()),
                },
                Param { key: "detChars", name: DET_CHARS_NAME, tooltip: "Detector characteristics", value: ParamValue::Table(None) },
                Param {
                    key: "damping",
                    name: DAMPING_NAME,
                    tooltip: "Damping factor for all detectors. Sensible range is between 0.0001 and 0.0005",
                    value: ParamValue::number(0.0001),
                },
                Param { key: "gain", name: GAIN_NAME, tooltip: "Gain applied to output. Default is 25", value: ParamValue::number(25.0) },
                Param { key: "method", name: "Numerical method", tooltip: "Numerical method used to solve equation", value: ParamValue::choice(&METHOD_LABELS, 0) },
                Param { key: "freqNorm", name: "Frequency normalization", tooltip: "Whether to normalize frequency", value: ParamValue::choice(&FREQ_NORM_LABELS, 0) },
                Param { key: "ampNorm", name: "Amplitude normalization", tooltip: "Whether to normalize amplitude response", value: ParamValue::choice(&AMP_NORM_LABELS, 0) },
            ],
            current_profile: None,
            altered: false,
        }
    }
}

impl ParamForm {
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.key == key).map(|p| &p.value)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut ParamValue> {
        self.params.iter_mut().find(|p| p.key == key).map(|p| &mut p.value)
    }

    pub fn current_profile(&self) -> Option<&str> {
        self.current_profile.as_deref()
    }

    pub fn set_current_profile(&mut self, name: Option<String>) {
        self.current_profile = name;
    }

    /// True once the user has edited a field since the last profile load.
    pub fn is_altered(&self) -> bool {
        self.altered
    }

    /// User edit. Marks the current profile as altered.
    pub fn set_value(&mut self, key: &str, value: Value) -> bool {
        let ok = self.get_mut(key).map(|p| p.set(value)).unwrap_or(false);
        if ok {
            self.altered = true;
        }
        ok
    }

    /// User edit from text input.
    pub fn set_text(&mut self, key: &str, text: &str) -> bool {
        let ok = self.get_mut(key).map(|p| p.set_text(text)).unwrap_or(false);
        if ok {
            self.altered = true;
        }
        ok
    }

    /// Follow the loaded audio. Not a user edit.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if let Some(p) = self.get_mut("sr") {
            p.set(Value::Number(sample_rate as f64));
        }
    }

    /// Fill every field from `params` (profile load); clears the altered flag.
    pub fn set_params(&mut self, params: &DetectorParams) {
        let (method, freq_norm, amp_norm) = params.features.choice_indices();
        let values = [
            ("sr", Value::Number(params.sample_rate)),
            ("numThreads", Value::Number(params.num_threads as f64)),
            ("detChars", Value::Table(params.det_chars.clone())),
            ("damping", Value::Number(params.damping)),
            ("gain", Value::Number(params.gain)),
            ("method", Value::Choice(method)),
            ("freqNorm", Value::Choice(freq_norm)),
            ("ampNorm", Value::Choice(amp_norm)),
        ];
        for (key, value) in values {
            if let Some(p) = self.get_mut(key) {
                p.set(value);
            }
        }
        self.altered = false;
    }

    /// Read all fields into `DetectorParams`.
    ///
    /// Every unset or invalid field is reported in one `InvalidArgs` error.
    pub fn get_args(&self) -> Result<DetectorParams, SetupError> {
        let mut invalid = Vec::new();
        let mut number = |key: &str| -> f64 {
            match self.get(key).and_then(ParamValue::get) {
                Some(Value::Number(v)) => v,
                _ => {
                    invalid.push(self.name_of(key));
                    0.0
                }
            }
        };
        let sample_rate = number("sr");
        let num_threads = number("numThreads");
        let damping = number("damping");
        let gain = number("gain");

        let det_chars = match self.get("detChars").and_then(ParamValue::get) {
            Some(Value::Table(t)) => t,
            _ => {
                invalid.push(self.name_of("detChars"));
                Vec::new()
            }
        };

        let mut choice = |key: &str| -> usize {
            match self.get(key).and_then(ParamValue::get) {
                Some(Value::Choice(i)) => i,
                _ => {
                    invalid.push(self.name_of(key));
                    0
                }
            }
        };
        let method = choice("method");
        let freq_norm = choice("freqNorm");
        let amp_norm = choice("ampNorm");

        // keep form order in the message
        invalid.sort_by_key(|name| self.params.iter().position(|p| p.name == name));

        if !invalid.is_empty() {
            return Err(SetupError::InvalidArgs { fields: invalid });
        }

        let params = DetectorParams {
            sample_rate,
            num_threads: num_threads.max(0.0) as usize,
            det_chars,
            damping,
            gain,
            features: Features::from_choices(method, freq_norm, amp_norm),
        };
        params.validate()?;
        Ok(params)
    }

    fn name_of(&self, key: &str) -> String {
        self.params
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.name.to_string())
            .unwrap_or_else(|| key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_form() -> ParamForm {
        let mut form = ParamForm::default();
        form.set_params(&DetectorParams::default());
        form
    }

    #[test]
    fn test_default_params() {
        let p = DetectorParams::default();
        assert_eq!(p.det_chars.len(), 88);
        assert!((p.det_chars[48].freq - 440.0).abs() < 1e-9);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_feature_set_round_trip() {
        let f = Features {
            method: NumericalMethod::CentralDifference,
            freq_norm: FreqNorm::SearchNormalized,
            amp_norm: AmpNorm::Normalized,
        };
        let text = f.to_feature_set();
        assert_eq!(text, "Central difference method,Search-normalized,Amplitude normalized");
        assert_eq!(Features::parse_feature_set(&text).unwrap(), f);
        assert!(Features::parse_feature_set("Runge-Kutta method,Bogus,Amplitude normalized").is_err());
        assert!(Features::parse_feature_set("Runge-Kutta method").is_err());
    }

    #[test]
    fn test_param_value_kinds() {
        let mut v = ParamValue::integer(4);
        assert_eq!(v.get(), Some(Value::Number(4.0)));
        assert!(!v.set(Value::Choice(1)));
        assert!(v.set(Value::Number(2.5)));
        assert_eq!(v.get(), None); // not an integer

        let mut c = ParamValue::choice(&METHOD_LABELS, 0);
        assert!(c.set_text("Central difference"));
        assert_eq!(c.get(), Some(Value::Choice(1)));
        assert!(!c.set_text("Euler"));
        assert!(!c.set(Value::Choice(7)));

        let mut t = ParamValue::Table(None);
        assert_eq!(t.get(), None);
        t.set(Value::Table(Vec::new()));
        assert_eq!(t.get(), None);
    }

    #[test]
    fn test_get_args_from_filled_form() {
        let params = filled_form().get_args().unwrap();
        assert_eq!(params, DetectorParams::default());
    }

    #[test]
    fn test_get_args_reports_all_invalid_fields() {
        let mut form = filled_form();
        form.set_text("damping", "abc");
        form.set_text("gain", "");
        if let Some(p) = form.get_mut("detChars") {
            p.clear();
        }
        match form.get_args() {
            Err(SetupError::InvalidArgs { fields }) => {
                assert_eq!(fields, vec!["Frequencies and bandwidths", "Damping", "Gain"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_validate_lists_every_bad_field() {
        let p = DetectorParams {
            sample_rate: 0.0,
            det_chars: Vec::new(),
            damping: f64::NAN,
            gain: -1.0,
            ..DetectorParams::default()
        };
        match p.validate() {
            Err(SetupError::InvalidArgs { fields }) => {
                assert_eq!(fields, vec!["Sample rate", "Frequencies and bandwidths", "Damping", "Gain"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut p = DetectorParams::default();
        p.det_chars[3].bandwidth = -2.0;
        assert_eq!(
            p.validate(),
            Err(SetupError::InvalidArgs { fields: vec!["Frequencies and bandwidths".into()] })
        );
    }

    #[test]
    fn test_form_rejects_out_of_range_numbers() {
        let mut form = filled_form();
        form.set_text("damping", "-0.5");
        match form.get_args() {
            Err(SetupError::InvalidArgs { fields }) => assert_eq!(fields, vec!["Damping"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_central_difference_requires_zero_bandwidth() {
        let mut form = filled_form();
        form.set_value("method", Value::Choice(1));
        form.set_value("detChars", Value::Table(vec![DetectorChar::new(440.0, 0.0), DetectorChar::new(880.0, 2.0)]));
        assert_eq!(form.get_args(), Err(SetupError::IncompatibleMethod));

        form.set_value("detChars", Value::Table(vec![DetectorChar::new(440.0, 0.0)]));
        let params = form.get_args().unwrap();
        assert_eq!(params.features.method, NumericalMethod::CentralDifference);
    }

    #[test]
    fn test_altered_flag() {
        let mut form = filled_form();
        assert!(!form.is_altered());
        form.set_sample_rate(44100);
        assert!(!form.is_altered());
        assert_eq!(form.get_args().unwrap().sample_rate, 44100.0);
        form.set_text("gain", "30");
        assert!(form.is_altered());
        form.set_params(&DetectorParams::default());
        assert!(!form.is_altered());
    }
}
