use eframe::egui;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};

use crate::analysis::{AnalysisEvent, Analyser, ForwardingSink, ResponseMatrix, ResultSink};
use crate::engine::ResonatorBank;
use crate::error::SetupError;
use crate::params::{DetectorChar, ParamForm, ParamValue, Value};
use crate::player::{SegmentPlayer, SegmentSource};
use crate::profile::{ProfileManager, DEFAULT_PROFILE_NAME};
use crate::registry::{SegmentRegistry, SegmentRequest};
use crate::results::{ResultsGrid, DEFAULT_COLS, DEFAULT_ROWS};
use crate::settings::{self, ConfigStore};
use crate::{audio, export, freqs, Color};

/// Columns between progress events sent to the UI.
const PROGRESS_INCREMENT: usize = 10;

pub fn run(initial_file: Option<PathBuf>, store: Box<dyn ConfigStore>) -> anyhow::Result<()> {
    let size = store
        .value(settings::WINDOW_GEOMETRY)
        .and_then(|g| parse_geometry(&g))
        .unwrap_or([1200.0, 800.0]);
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size(size)
            .with_min_inner_size([900.0, 600.0]),
        ..Default::default()
    };
    eframe::run_native(
        "DetectorBank",
        options,
        Box::new(move |cc| Ok(Box::new(DetBankApp::new(initial_file, store, cc.egui_ctx.clone())))),
    )
    .map_err(|e| anyhow::anyhow!("GUI Error: {}", e))
}

pub fn configure_visuals(ctx: &egui::Context, dark: bool) {
    let mut visuals = if dark { egui::Visuals::dark() } else { egui::Visuals::light() };
    visuals.window_corner_radius = egui::CornerRadius::same(8);
    ctx.set_visuals(visuals);
}

fn parse_geometry(text: &str) -> Option<[f32; 2]> {
    let (w, h) = text.split_once('x')?;
    Some([w.trim().parse().ok()?, h.trim().parse().ok()?])
}

fn color32(c: Color) -> egui::Color32 {
    egui::Color32::from_rgba_unmultiplied(c.r, c.g, c.b, c.a)
}

enum AppMessage {
    Loaded(String, Arc<audio::AudioData>),
    Error(String),
    RunFailed(String),
}

/// An analysis in flight, drained every frame.
struct RunState {
    progress: Receiver<AnalysisEvent>,
    results: Receiver<(usize, ResponseMatrix)>,
    done: usize,
    total: usize,
    finished: bool,
}

#[derive(Clone, Copy)]
enum Edge {
    Start,
    Stop,
}

pub struct DetBankApp {
    msg_receiver: Receiver<AppMessage>,
    msg_sender: Sender<AppMessage>,
    ctx: egui::Context,
    store: Box<dyn ConfigStore>,
    profiles: Option<ProfileManager>,
    player: Option<SegmentPlayer>,

    // Audio
    audio: Option<Arc<audio::AudioData>>,
    samples: Option<Arc<[f32]>>,
    file_name: Option<String>,
    loading: bool,
    waveform_cache: Option<Vec<f32>>,

    // Segments
    registry: SegmentRegistry,
    dragging: Option<(usize, Edge)>,
    loop_playback: bool,

    // Parameters
    form: ParamForm,
    field_text: HashMap<&'static str, String>,
    note_lo: String,
    note_hi: String,
    bandwidth: f64,
    ref_freq: f64,
    edo: u32,
    eq_n0: i32,
    eq_n1: i32,
    selected_profile: String,
    new_profile_name: String,
    downsample: usize,
    save_results: bool,
    export_dir: Option<PathBuf>,

    // Results
    grid: ResultsGrid,
    grid_rows: usize,
    grid_cols: usize,
    run: Option<RunState>,

    status: Option<String>,
    dark: bool,
}

impl DetBankApp {
    pub fn new(initial_file: Option<PathBuf>, store: Box<dyn ConfigStore>, ctx: egui::Context) -> Self {
        let (sender, receiver) = unbounded();
        let dark = store.value(settings::WINDOW_VIEW_MODE).as_deref() != Some("light");
        configure_visuals(&ctx, dark);

        let rows = settings::get_parsed(store.as_ref(), settings::PLOT_ROWS, DEFAULT_ROWS).max(1);
        let cols = settings::get_parsed(store.as_ref(), settings::PLOT_COLS, DEFAULT_COLS).max(1);
        let downsample = settings::get_parsed(store.as_ref(), settings::DOWNSAMPLE, settings::DEFAULT_DOWNSAMPLE).max(1);
        let export_dir = store.value(settings::EXPORT_DIR).map(PathBuf::from);

        let profiles = match ProfileManager::default_path().map(ProfileManager::open) {
            Some(Ok(mut manager)) => {
                if let Err(e) = manager.ensure_default() {
                    warn!("Could not create default profile: {:#}", e);
                }
                Some(manager)
            }
            Some(Err(e)) => {
                warn!("Profiles unavailable: {:#}", e);
                None
            }
            None => None,
        };

        let player = match SegmentPlayer::new() {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("Playback disabled: {:#}", e);
                None
            }
        };

        let mut app = Self {
            msg_receiver: receiver,
            msg_sender: sender,
            ctx,
            store,
            profiles,
            player,
            audio: None,
            samples: None,
            file_name: None,
            loading: false,
            waveform_cache: None,
            registry: SegmentRegistry::new(),
            dragging: None,
            loop_playback: false,
            form: ParamForm::default(),
            field_text: HashMap::new(),
            note_lo: "A0".into(),
            note_hi: "C8".into(),
            bandwidth: 0.0,
            ref_freq: freqs::A4,
            edo: 12,
            eq_n0: -12,
            eq_n1: 12,
            selected_profile: DEFAULT_PROFILE_NAME.into(),
            new_profile_name: String::new(),
            downsample,
            save_results: export_dir.is_some(),
            export_dir,
            grid: ResultsGrid::new(rows, cols),
            grid_rows: rows,
            grid_cols: cols,
            run: None,
            status: None,
            dark,
        };

        let startup = app
            .store
            .value(settings::CURRENT_PROFILE)
            .or_else(|| app.store.value(settings::DEFAULT_PROFILE))
            .unwrap_or_else(|| DEFAULT_PROFILE_NAME.into());
        app.load_profile(&startup);
        app.sync_field_text();

        if let Some(path) = initial_file {
            app.load_file(path);
        }
        app
    }

    fn load_file(&mut self, path: PathBuf) {
        let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
        self.file_name = Some(name.clone());
        self.waveform_cache = None;
        self.loading = true;

        let sender = self.msg_sender.clone();
        let ctx = self.ctx.clone();
        thread::spawn(move || {
            let msg = match audio::load_audio_file(&path) {
                Ok(data) => AppMessage::Loaded(name, Arc::new(data)),
                Err(e) => AppMessage::Error(format!("{:#}", e)),
            };
            sender.send(msg).ok();
            ctx.request_repaint();
        });
    }

    fn on_loaded(&mut self, name: String, data: Arc<audio::AudioData>) {
        self.loading = false;
        self.file_name = Some(name);
        self.generate_waveform(&data.samples);
        self.registry.set_audio(data.samples.len(), data.sample_rate);
        self.form.set_sample_rate(data.sample_rate);
        self.sync_field_text();
        self.samples = Some(data.samples.clone().into());
        self.audio = Some(data);
    }

    fn load_profile(&mut self, name: &str) {
        let Some(manager) = &self.profiles else {
            return;
        };
        match manager.load(name) {
            Ok(mut params) => {
                // the loaded file decides the sample rate
                if let Some(a) = &self.audio {
                    params.sample_rate = a.sample_rate as f64;
                }
                self.form.set_params(&params);
                self.form.set_current_profile(Some(name.to_string()));
                self.selected_profile = name.to_string();
                self.store.set_value(settings::CURRENT_PROFILE, name.to_string());
                self.sync_field_text();
            }
            Err(e) => self.status = Some(format!("{:#}", e)),
        }
    }

    fn save_profile(&mut self, name: &str) {
        let params = match self.form.get_args() {
            Ok(p) => p,
            Err(e) => {
                self.status = Some(e.to_string());
                return;
            }
        };
        let Some(manager) = &mut self.profiles else {
            return;
        };
        match manager.save(name, &params) {
            Ok(()) => {
                self.form.set_params(&params);
                self.form.set_current_profile(Some(name.to_string()));
                self.selected_profile = name.to_string();
                self.status = Some(format!("Saved profile '{}'", name));
            }
            Err(e) => self.status = Some(format!("{:#}", e)),
        }
    }

    fn delete_profile(&mut self, name: &str) {
        let Some(manager) = &mut self.profiles else {
            return;
        };
        match manager.remove(name) {
            Ok(true) => {
                if self.form.current_profile() == Some(name) {
                    self.form.set_current_profile(None);
                    self.store.remove(settings::CURRENT_PROFILE);
                }
                if self.store.value(settings::DEFAULT_PROFILE).as_deref() == Some(name) {
                    self.store.remove(settings::DEFAULT_PROFILE);
                }
                self.selected_profile = DEFAULT_PROFILE_NAME.into();
                self.status = Some(format!("Deleted profile '{}'", name));
                self.persist();
            }
            Ok(false) => self.status = Some(format!("No profile named '{}'", name)),
            Err(e) => self.status = Some(format!("{:#}", e)),
        }
    }

    /// Refresh the text buffers of numeric fields from the form.
    fn sync_field_text(&mut self) {
        for p in self.form.params() {
            if let ParamValue::Number { value: Some(v), .. } = p.value {
                self.field_text.insert(p.key, v.to_string());
            }
        }
    }

    fn persist(&mut self) {
        settings::set_display(self.store.as_mut(), settings::DOWNSAMPLE, self.downsample);
        settings::set_display(self.store.as_mut(), settings::PLOT_ROWS, self.grid.rows());
        settings::set_display(self.store.as_mut(), settings::PLOT_COLS, self.grid.cols());
        self.store
            .set_value(settings::WINDOW_VIEW_MODE, if self.dark { "dark" } else { "light" }.into());
        match &self.export_dir {
            Some(dir) => self.store.set_value(settings::EXPORT_DIR, dir.to_string_lossy().into_owned()),
            None => self.store.remove(settings::EXPORT_DIR),
        }
        if let Some(rect) = self.ctx.input(|i| i.viewport().inner_rect) {
            self.store.set_value(
                settings::WINDOW_GEOMETRY,
                format!("{}x{}", rect.width().round(), rect.height().round()),
            );
        }
        if let Err(e) = self.store.save() {
            warn!("Failed to save settings: {:#}", e);
        }
    }

    fn play_segment(&mut self, idx: usize) {
        let (Some(player), Some(samples), Some(audio)) = (&mut self.player, &self.samples, &self.audio) else {
            return;
        };
        let row = &self.registry.list().rows()[idx];
        let sr = audio.sample_rate as f64;
        let range = ((row.start * sr) as usize, (row.stop * sr) as usize);
        let source = SegmentSource::new(samples.clone(), audio.sample_rate, range, self.loop_playback);
        if let Err(e) = player.play(source) {
            self.status = Some(format!("{:#}", e));
        }
    }

    fn export_segment(&mut self, idx: usize) {
        let (Some(samples), Some(audio)) = (&self.samples, &self.audio) else {
            return;
        };
        let row = &self.registry.list().rows()[idx];
        let sr = audio.sample_rate as f64;
        let range = ((row.start * sr) as usize, (row.stop * sr) as usize);
        let default_name = format!("{}-{}_samples.wav", range.0, range.1);
        if let Some(path) = rfd::FileDialog::new().set_file_name(default_name).save_file() {
            if let Err(e) = export::export_segment_wav(&path, samples, audio.sample_rate, range) {
                self.status = Some(format!("{:#}", e));
            }
        }
    }

    fn start_analysis(&mut self) {
        if self.run.as_ref().is_some_and(|r| !r.finished) {
            return;
        }
        let (Some(samples), Some(audio)) = (self.samples.clone(), self.audio.clone()) else {
            self.status = Some(SetupError::MissingAudio.to_string());
            return;
        };
        let params = match self.form.get_args() {
            Ok(p) => p,
            Err(e) => {
                self.status = Some(e.to_string());
                return;
            }
        };
        let segments = self.registry.segments();
        let save_dir = if self.save_results { self.export_dir.clone() } else { None };

        let (progress_tx, progress_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        let mut analyser = Analyser::new(Arc::new(ResonatorBank), progress_tx).with_progress_increment(PROGRESS_INCREMENT);
        let total = match analyser.set_params(
            samples,
            audio.sample_rate,
            &params,
            &segments,
            self.downsample,
            save_dir.as_deref(),
            &mut self.grid,
        ) {
            Ok(total) => total,
            Err(e) => {
                self.status = Some(format!("{:#}", e));
                return;
            }
        };

        self.run = Some(RunState {
            progress: progress_rx,
            results: result_rx,
            done: 0,
            total,
            finished: false,
        });
        self.persist();

        let sender = self.msg_sender.clone();
        let ctx = self.ctx.clone();
        thread::spawn(move || {
            let mut sink = ForwardingSink::new(result_tx);
            if let Err(e) = analyser.start(&mut sink) {
                error!("Analysis failed: {:#}", e);
                sender.send(AppMessage::RunFailed(format!("{:#}", e))).ok();
            }
            ctx.request_repaint();
        });
    }

    fn drain_run(&mut self) {
        let Some(run) = &mut self.run else {
            return;
        };
        for event in run.progress.try_iter() {
            match event {
                AnalysisEvent::Progress(n) => run.done += n,
                AnalysisEvent::Finished => {
                    run.finished = true;
                    run.done = run.total;
                    info!("Analysis finished");
                }
            }
        }
        if let Some(e) = drain_results(&run.results, &mut self.grid) {
            self.status = Some(e);
        }
        if !run.finished {
            self.ctx.request_repaint_after(Duration::from_millis(50));
        }
    }

    fn generate_waveform(&mut self, samples: &[f32]) {
        let width = 1200;
        let step = (samples.len() / width).max(1);
        let mut cache = Vec::with_capacity(width * 2);

        for chunk in samples.chunks(step).take(width) {
            let (min, max) = chunk
                .iter()
                .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            cache.push(min);
            cache.push(max);
        }
        self.waveform_cache = Some(cache);
    }

    fn timeline_ui(&mut self, ui: &mut egui::Ui) {
        let size = egui::vec2(ui.available_width(), 120.0);
        let (response, painter) = ui.allocate_painter(size, egui::Sense::click_and_drag());
        let rect = response.rect;
        painter.rect_filled(rect, 4.0, ui.visuals().extreme_bg_color);

        let duration = self.registry.duration().max(f64::EPSILON);
        let to_x = |t: f64| rect.left() + (t / duration) as f32 * rect.width();
        let to_t = |x: f32| (((x - rect.left()) / rect.width()) as f64 * duration).clamp(0.0, duration);

        for region in self.registry.timeline().regions() {
            let r = egui::Rect::from_x_y_ranges(to_x(region.start)..=to_x(region.stop), rect.y_range());
            painter.rect_filled(r, 0.0, color32(region.color));
            let edge = egui::Stroke::new(1.5, color32(region.color.opaque()));
            painter.line_segment([r.left_top(), r.left_bottom()], edge);
            painter.line_segment([r.right_top(), r.right_bottom()], edge);
        }

        if let Some(cache) = &self.waveform_cache {
            let bins = cache.len() / 2;
            let stroke = egui::Stroke::new(1.0, ui.visuals().text_color());
            for i in 0..bins {
                let x = rect.left() + rect.width() * i as f32 / bins.max(1) as f32;
                let y = |v: f32| rect.center().y - v * rect.height() / 2.0;
                painter.line_segment([egui::pos2(x, y(cache[2 * i])), egui::pos2(x, y(cache[2 * i + 1]))], stroke);
            }
        }

        let Some(pos) = response.interact_pointer_pos().or(response.hover_pos()) else {
            return;
        };
        let t = to_t(pos.x);

        if response.drag_started() {
            let near = |x: f32| (x - pos.x).abs() < 6.0;
            self.dragging = self
                .registry
                .timeline()
                .regions()
                .iter()
                .enumerate()
                .find_map(|(i, r)| {
                    if near(to_x(r.start)) {
                        Some((i, Edge::Start))
                    } else if near(to_x(r.stop)) {
                        Some((i, Edge::Stop))
                    } else {
                        None
                    }
                });
        }
        if response.dragged() {
            if let Some((idx, edge)) = self.dragging {
                let request = match edge {
                    Edge::Start => SegmentRequest::SetRange { index: idx, start: Some(t), stop: None },
                    Edge::Stop => SegmentRequest::SetRange { index: idx, start: None, stop: Some(t) },
                };
                self.registry.handle(request);
            }
        }
        if response.drag_stopped() {
            self.dragging = None;
        }
        if response.double_clicked() {
            self.registry.handle(SegmentRequest::Add { start: Some(t), stop: None });
        }
        if response.secondary_clicked() {
            self.registry.delete_at(t);
        }
        response.on_hover_text("Drag edges to resize, double-click to add, right-click to remove");
    }

    fn segment_list_ui(&mut self, ui: &mut egui::Ui) {
        let mut requests = Vec::new();
        let mut play = None;
        let mut export_idx = None;

        egui::ScrollArea::vertical().max_height(180.0).show(ui, |ui| {
            egui::Grid::new("segments").striped(true).show(ui, |ui| {
                for (idx, row) in self.registry.list().rows().iter().enumerate() {
                    let (swatch, _) = ui.allocate_exact_size(egui::vec2(12.0, 12.0), egui::Sense::hover());
                    ui.painter().rect_filled(swatch, 2.0, color32(row.color.opaque()));

                    let max = row.maximum.unwrap_or(f64::MAX);
                    let (mut start, mut stop) = (row.start, row.stop);
                    ui.label("Start");
                    if ui.add(egui::DragValue::new(&mut start).range(row.minimum..=max).speed(0.01).suffix(" s")).changed() {
                        requests.push(SegmentRequest::SetRange { index: idx, start: Some(start), stop: None });
                    }
                    ui.label("Stop");
                    if ui.add(egui::DragValue::new(&mut stop).range(row.minimum..=max).speed(0.01).suffix(" s")).changed() {
                        requests.push(SegmentRequest::SetRange { index: idx, start: None, stop: Some(stop) });
                    }
                    if ui.button("▶").on_hover_text("Play segment").clicked() {
                        play = Some(idx);
                    }
                    if ui.button("💾").on_hover_text("Export segment audio").clicked() {
                        export_idx = Some(idx);
                    }
                    if self.registry.list().is_removable(idx) && ui.button("✖").clicked() {
                        requests.push(SegmentRequest::Remove(idx));
                    }
                    ui.end_row();
                }
            });
        });

        // play and export read rows by index, so they run before any removal
        if let Some(idx) = play {
            self.play_segment(idx);
        }
        if let Some(idx) = export_idx {
            self.export_segment(idx);
        }

        ui.horizontal(|ui| {
            if ui.button("Add segment").clicked() {
                requests.push(SegmentRequest::Add { start: None, stop: None });
            }
            if ui.button("Remove all").clicked() {
                requests.push(SegmentRequest::RemoveAll);
            }
            ui.separator();
            ui.checkbox(&mut self.loop_playback, "Loop");
            if let Some(p) = &mut self.player {
                let mut volume = p.volume();
                if ui.add(egui::Slider::new(&mut volume, 0.0..=1.0).text("Volume")).changed() {
                    p.set_volume(volume);
                }
                if ui.add_enabled(p.is_playing(), egui::Button::new("Stop playback")).clicked() {
                    p.stop();
                }
            }
        });

        for request in requests {
            self.registry.handle(request);
        }
    }

    fn params_ui(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            let title = match self.form.current_profile() {
                Some(name) if self.form.is_altered() => format!("Profile: {}*", name),
                Some(name) => format!("Profile: {}", name),
                None => "Profile: (none)".to_string(),
            };
            ui.strong(title);
        });

        let names = self.profiles.as_ref().map(ProfileManager::profiles).unwrap_or_default();
        let mut load = None;
        let mut delete = None;
        ui.horizontal(|ui| {
            egui::ComboBox::from_id_salt("profile_select")
                .selected_text(self.selected_profile.clone())
                .show_ui(ui, |ui| {
                    for name in &names {
                        ui.selectable_value(&mut self.selected_profile, name.clone(), name);
                    }
                });
            if ui.button("Load").clicked() {
                load = Some(self.selected_profile.clone());
            }
            if ui.button("Set default").clicked() {
                self.store.set_value(settings::DEFAULT_PROFILE, self.selected_profile.clone());
                self.persist();
            }
            let deletable = self.selected_profile != DEFAULT_PROFILE_NAME;
            if ui.add_enabled(deletable, egui::Button::new("Delete")).clicked() {
                delete = Some(self.selected_profile.clone());
            }
        });
        if let Some(name) = load {
            self.load_profile(&name);
        }
        if let Some(name) = delete {
            self.delete_profile(&name);
        }

        let mut save = None;
        ui.horizontal(|ui| {
            ui.text_edit_singleline(&mut self.new_profile_name);
            if ui.button("Save profile").clicked() && !self.new_profile_name.trim().is_empty() {
                save = Some(self.new_profile_name.trim().to_string());
            }
        });
        if let Some(name) = save {
            self.save_profile(&name);
        }
        ui.separator();

        let fields: Vec<(&'static str, &'static str, &'static str, ParamValue)> = self
            .form
            .params()
            .iter()
            .map(|p| (p.key, p.name, p.tooltip, p.value.clone()))
            .collect();

        egui::Grid::new("params").num_columns(2).show(ui, |ui| {
            for (key, name, tooltip, value) in fields {
                ui.label(name).on_hover_text(tooltip);
                let valid = value.get().is_some();
                match value {
                    ParamValue::Number { .. } => {
                        let text = self.field_text.entry(key).or_default();
                        let edit = egui::TextEdit::singleline(text).desired_width(120.0);
                        let edit = if valid { edit } else { edit.text_color(egui::Color32::RED) };
                        if ui.add(edit).changed() {
                            let text = text.clone();
                            self.form.set_text(key, &text);
                        }
                    }
                    ParamValue::Choice { options, selected } => {
                        let mut current = selected.unwrap_or(0);
                        egui::ComboBox::from_id_salt(key)
                            .selected_text(options.get(current).copied().unwrap_or(""))
                            .show_ui(ui, |ui| {
                                for (i, label) in options.iter().enumerate() {
                                    ui.selectable_value(&mut current, i, *label);
                                }
                            });
                        if Some(current) != selected {
                            self.form.set_value(key, Value::Choice(current));
                        }
                    }
                    ParamValue::Table(table) => {
                        let summary = match &table {
                            Some(t) if !t.is_empty() => {
                                let lo = t.iter().map(|c| c.freq).fold(f64::MAX, f64::min);
                                let hi = t.iter().map(|c| c.freq).fold(f64::MIN, f64::max);
                                format!("{} detectors, {:.1}-{:.1} Hz", t.len(), lo, hi)
                            }
                            _ => "No detectors".to_string(),
                        };
                        ui.colored_label(if valid { ui.visuals().text_color() } else { egui::Color32::RED }, summary);
                    }
                }
                ui.end_row();
            }
        });

        ui.horizontal(|ui| {
            ui.label("Notes");
            ui.add(egui::TextEdit::singleline(&mut self.note_lo).desired_width(40.0));
            ui.label("to");
            ui.add(egui::TextEdit::singleline(&mut self.note_hi).desired_width(40.0));
            ui.label("bw");
            ui.add(egui::DragValue::new(&mut self.bandwidth).range(0.0..=1000.0).speed(0.1).suffix(" Hz"));
            if ui.button("Set").clicked() {
                match freqs::note_range(&self.note_lo, &self.note_hi) {
                    Ok(fs) => {
                        let table = fs.into_iter().map(|f| DetectorChar::new(f, self.bandwidth)).collect();
                        self.form.set_value("detChars", Value::Table(table));
                    }
                    Err(e) => self.status = Some(format!("{:#}", e)),
                }
            }
        });
        ui.horizontal(|ui| {
            ui.add(egui::DragValue::new(&mut self.ref_freq).range(0.001..=100_000.0).speed(0.1).suffix(" Hz"));
            ui.label("× 2^(n /");
            ui.add(egui::DragValue::new(&mut self.edo).range(1..=1000));
            ui.label("), n");
            ui.add(egui::DragValue::new(&mut self.eq_n0).range(-1000..=1000));
            ui.label("to");
            ui.add(egui::DragValue::new(&mut self.eq_n1).range(-1000..=1000));
            if ui.button("Set").clicked() {
                match freqs::equation(self.ref_freq, self.edo, self.eq_n0, self.eq_n1) {
                    Ok(fs) => {
                        let table = fs.into_iter().map(|f| DetectorChar::new(f, self.bandwidth)).collect();
                        self.form.set_value("detChars", Value::Table(table));
                    }
                    Err(e) => self.status = Some(format!("{:#}", e)),
                }
            }
        });
        self.table_editor_ui(ui);
        ui.separator();

        ui.horizontal(|ui| {
            ui.label("Downsample");
            if ui.add(egui::DragValue::new(&mut self.downsample).range(1..=100_000)).changed() {
                self.persist();
            }
        });
        ui.horizontal(|ui| {
            ui.checkbox(&mut self.save_results, "Save CSV to");
            let label = self
                .export_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "(no directory)".into());
            if ui.button(label).clicked() {
                if let Some(dir) = rfd::FileDialog::new().pick_folder() {
                    self.export_dir = Some(dir);
                    self.save_results = true;
                    self.persist();
                }
            }
        });
    }

    /// Per-row frequency and bandwidth editing of the detector table.
    fn table_editor_ui(&mut self, ui: &mut egui::Ui) {
        let mut table = match self.form.get("detChars") {
            Some(ParamValue::Table(Some(t))) => t.clone(),
            _ => Vec::new(),
        };
        let mut edited = false;

        egui::CollapsingHeader::new("Edit detectors").show(ui, |ui| {
            let mut remove = None;
            egui::ScrollArea::vertical().id_salt("det_table").max_height(200.0).show(ui, |ui| {
                egui::Grid::new("det_chars").num_columns(3).striped(true).show(ui, |ui| {
                    ui.strong("Frequency");
                    ui.strong("Bandwidth");
                    ui.end_row();
                    for (i, row) in table.iter_mut().enumerate() {
                        edited |= ui
                            .add(egui::DragValue::new(&mut row.freq).range(0.001..=100_000.0).speed(0.1).suffix(" Hz"))
                            .changed();
                        edited |= ui
                            .add(egui::DragValue::new(&mut row.bandwidth).range(0.0..=1000.0).speed(0.1).suffix(" Hz"))
                            .changed();
                        if ui.button("✖").clicked() {
                            remove = Some(i);
                        }
                        ui.end_row();
                    }
                });
            });
            if let Some(i) = remove {
                table.remove(i);
                edited = true;
            }
            ui.horizontal(|ui| {
                if ui.button("Add row").clicked() {
                    let freq = table.last().map_or(freqs::A4, |c| c.freq);
                    table.push(DetectorChar::new(freq, self.bandwidth));
                    edited = true;
                }
                if ui.button("Load CSV").clicked() {
                    if let Some(path) = rfd::FileDialog::new().add_filter("CSV", &["csv"]).pick_file() {
                        match export::read_detector_chars(&path) {
                            Ok(chars) => {
                                table = chars;
                                edited = true;
                            }
                            Err(e) => self.status = Some(format!("{:#}", e)),
                        }
                    }
                }
            });
        });

        if edited {
            self.form.set_value("detChars", Value::Table(table));
        }
    }

    fn results_ui(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            ui.label("Rows");
            ui.add(egui::DragValue::new(&mut self.grid_rows).range(1..=8));
            ui.label("Cols");
            ui.add(egui::DragValue::new(&mut self.grid_cols).range(1..=8));
            if ui.button("Apply").clicked() {
                self.grid.apply_grid(self.grid_rows, self.grid_cols);
                self.persist();
            }
            ui.separator();
            if ui.add_enabled(self.grid.has_prev(), egui::Button::new("◀")).clicked() {
                self.grid.prev_page();
            }
            ui.label(self.grid.page_label());
            if ui.add_enabled(self.grid.has_next(), egui::Button::new("▶")).clicked() {
                self.grid.next_page();
            }
            ui.separator();
            let idle = self.run.as_ref().map_or(true, |r| r.finished);
            if ui.add_enabled(idle, egui::Button::new("Clear")).clicked() {
                self.grid.clear();
                self.run = None;
            }
        });

        let mut hovered = None;
        ui.horizontal_wrapped(|ui| {
            for (k, entry) in self.grid.legend().entries().iter().enumerate() {
                let text = egui::RichText::new(&entry.label).color(color32(entry.color));
                let text = if entry.highlighted { text.strong() } else { text };
                if ui.label(text).hovered() {
                    hovered = Some(k);
                }
            }
        });

        let avail = ui.available_size();
        let cell = egui::vec2(
            avail.x / self.grid.cols() as f32,
            (avail.y / self.grid.rows() as f32).max(80.0),
        );
        let (area, _) = ui.allocate_exact_size(avail, egui::Sense::hover());
        let painter = ui.painter_at(area);
        let highlighted = self.grid.legend().highlighted();
        let pointer = ui.input(|i| i.pointer.hover_pos());

        for (_, placement, slot) in self.grid.visible() {
            let min = area.min + egui::vec2(placement.col as f32 * cell.x, placement.row as f32 * cell.y);
            let rect = egui::Rect::from_min_size(min, cell).shrink(4.0);
            painter.rect_stroke(rect, 2.0, ui.visuals().widgets.noninteractive.bg_stroke, egui::StrokeKind::Inside);
            painter.text(
                rect.center_top() + egui::vec2(0.0, 2.0),
                egui::Align2::CENTER_TOP,
                &slot.title,
                egui::FontId::proportional(12.0),
                ui.visuals().text_color(),
            );
            let plot = rect.shrink2(egui::vec2(4.0, 10.0)).translate(egui::vec2(0.0, 8.0));

            let Some(data) = &slot.data else {
                painter.text(plot.center(), egui::Align2::CENTER_CENTER, "…", egui::FontId::proportional(14.0), egui::Color32::GRAY);
                continue;
            };
            let peak = data
                .traces
                .iter()
                .flat_map(|t| t.values.iter().copied())
                .fold(0.0f64, f64::max)
                .max(f64::EPSILON);
            let n = data.time.len();
            let to_pos = |i: usize, v: f64| {
                let x = plot.left() + plot.width() * i as f32 / (n.max(2) - 1) as f32;
                egui::pos2(x, plot.bottom() - (v / peak) as f32 * plot.height())
            };
            let step = (n / plot.width().max(1.0) as usize).max(1);

            for (k, trace) in data.traces.iter().enumerate() {
                let points: Vec<egui::Pos2> = (0..n).step_by(step).map(|i| to_pos(i, trace.values[i])).collect();
                let mut color = color32(trace.color.opaque());
                let width = match highlighted {
                    Some(h) if h == k => 2.5,
                    Some(_) => {
                        color = color.gamma_multiply(0.3);
                        1.0
                    }
                    None => 1.0,
                };
                painter.add(egui::Shape::line(points, egui::Stroke::new(width, color)));
            }

            if let Some(p) = pointer.filter(|p| plot.contains(*p)) {
                let i = (((p.x - plot.left()) / plot.width()) * (n.max(1) - 1) as f32).round() as usize;
                hovered = data
                    .traces
                    .iter()
                    .enumerate()
                    .filter_map(|(k, t)| t.values.get(i).map(|&v| (k, (to_pos(i, v).y - p.y).abs())))
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(k, _)| k);
            }
        }

        if hovered != highlighted {
            self.grid.legend_mut().highlight(hovered);
        }
    }
}

impl eframe::App for DetBankApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        while let Ok(msg) = self.msg_receiver.try_recv() {
            match msg {
                AppMessage::Loaded(name, data) => self.on_loaded(name, data),
                AppMessage::Error(e) => {
                    self.loading = false;
                    self.status = Some(format!("Error: {}", e));
                }
                AppMessage::RunFailed(e) => {
                    if let Some(err) = close_failed_run(self.run.take(), &mut self.grid) {
                        warn!("Dropped result: {}", err);
                    }
                    self.status = Some(format!("Analysis failed: {}", e));
                }
            }
        }
        self.drain_run();
        if let Some(msg) = self.registry.take_status() {
            self.status = Some(msg);
        }
        if ctx.input(|i| i.viewport().close_requested()) {
            self.persist();
        }

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui.button("Open audio").clicked() {
                    if let Some(path) = rfd::FileDialog::new().pick_file() {
                        self.load_file(path);
                    }
                }
                match (&self.file_name, &self.audio) {
                    (Some(name), Some(a)) if !self.loading => {
                        ui.label(format!("{} ({} Hz, {:.2} s)", a.title.as_deref().unwrap_or(name), a.sample_rate, a.duration()));
                    }
                    (Some(name), _) if self.loading => {
                        ui.spinner();
                        ui.label(format!("Reading {}", name));
                    }
                    _ => {
                        ui.label("No audio loaded");
                    }
                }
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if ui.button(if self.dark { "☀" } else { "🌙" }).clicked() {
                        self.dark = !self.dark;
                        configure_visuals(ctx, self.dark);
                        self.persist();
                    }
                });
            });
        });

        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal(|ui| {
                let running = self.run.as_ref().is_some_and(|r| !r.finished);
                if ui.add_enabled(!running && !self.loading, egui::Button::new("Analyse")).clicked() {
                    self.start_analysis();
                }
                if let Some(run) = &self.run {
                    let frac = if run.total == 0 { 1.0 } else { run.done as f32 / run.total as f32 };
                    ui.add(egui::ProgressBar::new(frac.min(1.0)).show_percentage().desired_width(240.0));
                }
                if let Some(status) = &self.status {
                    ui.label(status);
                }
            });
        });

        egui::SidePanel::left("params").min_width(320.0).show(ctx, |ui| {
            egui::ScrollArea::vertical().show(ui, |ui| self.params_ui(ui));
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            self.timeline_ui(ui);
            self.segment_list_ui(ui);
            ui.separator();
            self.results_ui(ui);
        });

        if !ctx.input(|i| i.raw.dropped_files.is_empty()) {
            let dropped = ctx.input(|i| i.raw.dropped_files.clone());
            if let Some(path) = dropped.first().and_then(|f| f.path.clone()) {
                self.load_file(path);
            }
        }
    }
}

/// Move every delivered result into the grid. Returns the last placement error.
fn drain_results(results: &Receiver<(usize, ResponseMatrix)>, grid: &mut ResultsGrid) -> Option<String> {
    let mut error = None;
    for (slot, data) in results.try_iter() {
        if let Err(e) = grid.add_data(slot, data) {
            error = Some(format!("{:#}", e));
        }
    }
    error
}

/// Tear down a run whose worker failed, keeping the results of the tasks
/// that finished before the failure.
fn close_failed_run(run: Option<RunState>, grid: &mut ResultsGrid) -> Option<String> {
    let run = run?;
    drain_results(&run.results, grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::PlotAllocator;
    use crate::segment::Segment;
    use crate::SEGMENT_PALETTE;

    #[test]
    fn test_failed_run_keeps_finished_results() {
        let mut grid = ResultsGrid::new(2, 2);
        let segments = [
            Segment::new(0.0, 1.0, Some(8000), SEGMENT_PALETTE[0]),
            Segment::new(1.0, 2.0, Some(8000), SEGMENT_PALETTE[1]),
        ];
        let slots = grid.add_plots(&[110.0, 220.0], &segments);

        let (_progress_tx, progress_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        result_tx.send((slots[0], ResponseMatrix::zeros(2, 4))).unwrap();
        drop(result_tx);
        let run = RunState {
            progress: progress_rx,
            results: result_rx,
            done: 0,
            total: 8,
            finished: false,
        };

        assert_eq!(close_failed_run(Some(run), &mut grid), None);
        assert!(grid.slot(slots[0]).data.is_some());
        assert!(grid.slot(slots[1]).data.is_none());
        assert_eq!(close_failed_run(None, &mut grid), None);
    }

    #[test]
    fn test_parse_geometry() {
        assert_eq!(parse_geometry("1200x800"), Some([1200.0, 800.0]));
        assert_eq!(parse_geometry(" 640 x 480 "), Some([640.0, 480.0]));
        assert_eq!(parse_geometry("wide"), None);
    }
}
