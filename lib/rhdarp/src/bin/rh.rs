use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{anyhow, Result};
use itertools::Itertools;
use tracing::*;

use instances::dataset::{DirLayout, IdxNameMap, darp::RequestFiles};
use rhdarp::*;
use rhdarp::data::*;
use rhdarp::rh::{self, DynamicConfig, GoodLpSolver, RequestStatus, RhConfig, RhOutcome, RhSummary, RollingHorizon, Route};

mod common;
use common::*;

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
struct ClArgs {
    /// An instance file, or a directory of them.
    #[structopt(parse(from_os_str))]
    path: PathBuf,
    #[structopt(long, default_value="*.txt")]
    pattern: String,
    /// File stems in the instance directory which are not instances.
    #[structopt(long, use_delimiter=true, default_value="distances,stations,coordinates")]
    exclude: Vec<String>,
    #[structopt(long, possible_values=&["unit", "matrix", "coords"], default_value="unit")]
    distances: String,
    /// Distance matrix or station coordinates, depending on `--distances`.
    #[structopt(long, parse(from_os_str))]
    station_file: Option<PathBuf>,
    /// With coordinates, drive straight between stations instead of along the line.
    #[structopt(long)]
    shortcuts: bool,
    #[structopt(long)]
    dynamic: bool,
    #[structopt(long, default_value="1", validator=clap_range_validator(Some(0.0f64), Some(1.0f64)))]
    share_static: f64,
    #[structopt(long, default_value="60", validator=clap_range_validator(Some(0.0f64), None))]
    notice: f64,
    #[structopt(long)]
    heuristic: bool,
    #[structopt(long)]
    accept_all: bool,
    #[structopt(long="excess")]
    consider_excess: bool,
    #[structopt(long)]
    excess_bound: Option<f64>,
    #[structopt(long, default_value="1")]
    excess_weight: f64,
    /// Per MILP, in seconds.
    #[structopt(long, short="t", default_value="3600", validator=clap_range_validator(Some(0.0f64), None))]
    time_limit: f64,
    #[structopt(long, default_value="10")]
    accept_weight: f64,
    #[structopt(long, default_value="1")]
    distance_weight: f64,
    #[structopt(long)]
    max_pickup_delay: Option<f64>,
    #[structopt(long, short="c", default_value="1", validator=clap_range_validator(Some(1), None))]
    cpus: usize,
    #[structopt(flatten)]
    output: OutputOptions,
}

impl ClArgs {
    fn distance_mode(&self) -> Result<DistanceMode> {
        let file = || self.station_file.clone()
            .ok_or_else(|| anyhow!("--distances {} needs --station-file", self.distances));
        Ok(match self.distances.as_str() {
            "matrix" => DistanceMode::Matrix(file()?),
            "coords" => DistanceMode::Coordinates { path: file()?, shortcuts: self.shortcuts },
            _ => DistanceMode::Unit,
        })
    }

    fn dynamic_config(&self) -> Option<DynamicConfig> {
        if self.dynamic {
            Some(DynamicConfig { share_static_requests: self.share_static, notice: self.notice })
        } else {
            None
        }
    }

    fn rh_config(&self) -> RhConfig {
        RhConfig {
            accept_all: self.accept_all,
            consider_excess_ride_time: self.consider_excess,
            excess_ride_time_bound: self.excess_bound,
            excess_ride_time_weight: self.excess_weight,
            dynamic: self.dynamic,
            heuristic: self.heuristic,
            time_limit: Duration::from_secs_f64(self.time_limit),
            weights: [self.accept_weight, self.distance_weight],
            max_pickup_delay: self.max_pickup_delay,
        }
    }

    fn instance_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.path.is_dir() {
            return Ok(vec![self.path.clone()]);
        }
        let exclude = self.exclude.iter().map(String::as_str).collect_vec();
        let dset = DirLayout::<RequestFiles>::new(&self.path, &self.pattern, &exclude)?;
        info!(instances=dset.len(), dir=?self.path, "instance directory");
        Ok((0..dset.len()).filter_map(|k| dset.path(k).map(Path::to_path_buf)).collect())
    }
}


struct InstanceResult {
    data: DarpInstance,
    outcome: RhOutcome,
    summary: RhSummary,
}

struct InstanceReport {
    name: String,
    result: Result<InstanceResult>,
}

struct BatchReport(Vec<InstanceReport>);

#[instrument(level="info", skip(mode, dynamic, config))]
fn run_instance(path: &Path, mode: &DistanceMode, dynamic: Option<&DynamicConfig>, config: &RhConfig) -> Result<InstanceResult> {
    let mut data = load_instance(path, mode)?;
    rh::prepare(&mut data, dynamic)?;
    let outcome = RollingHorizon::new(&mut data, config.clone(), GoodLpSolver).run()?;
    let summary = outcome.summary(&data);
    info!(accepted=summary.accepted, denied=summary.denied, milps=summary.num_milps, "instance done");
    Ok(InstanceResult { data, outcome, summary })
}

fn route_record(data: &DarpInstance, route: &Route) -> json::JsonValue {
    let stops: Vec<json::JsonValue> = route.nodes.iter()
        .filter(|&&i| i != data.o_depot)
        .map(|&i| {
            let node = data.node(i);
            let s = &node.schedule;
            json::object! {
                node: i,
                station: node.station,
                arrival: s.arrival_time,
                start: s.beginning_service,
                departure: s.departure_time,
                waiting: s.waiting_time,
                ride_time: s.ride_time,
                load: s.vehicle_load,
            }
        })
        .collect();
    json::object! {
        vehicle: route.vehicle,
        stops: stops,
    }
}

fn status_name(s: RequestStatus) -> &'static str {
    match s {
        RequestStatus::Unrevealed => "unrevealed",
        RequestStatus::Pending => "pending",
        RequestStatus::PickedUp => "picked_up",
        RequestStatus::DroppedOff => "dropped_off",
        RequestStatus::Denied => "denied",
    }
}

impl InstanceReport {
    fn summary_record(&self) -> json::JsonValue {
        match &self.result {
            Ok(r) => {
                let s = &r.summary;
                json::object! {
                    instance: self.name.as_str(),
                    status: "ok",
                    accepted: s.accepted,
                    denied: s.denied,
                    milps: s.num_milps,
                    time_model: r.outcome.time_model.as_secs_f64(),
                    time_solve: r.outcome.time_solve.as_secs_f64(),
                    objective: r.outcome.objective,
                    total_distance: s.total_distance,
                    avg_ride_time: s.avg_ride_time,
                    avg_excess_ride_time: s.avg_excess_ride_time,
                    avg_waiting_time: s.avg_waiting_time,
                }
            }
            Err(e) => json::object! {
                instance: self.name.as_str(),
                status: "error",
                error: format!("{:#}", e),
            },
        }
    }

    fn record(&self) -> json::JsonValue {
        let mut root = self.summary_record();
        if let Ok(r) = &self.result {
            let routes: Vec<json::JsonValue> = r.outcome.routes.iter().map(|route| route_record(&r.data, route)).collect();
            let requests: Vec<json::JsonValue> = r.outcome.status.iter()
                .sorted_by_key(|(k, _)| **k)
                .map(|(&k, &s)| json::object! {
                    request: k,
                    status: status_name(s),
                    become_known: r.data.become_known.get(&k).copied(),
                    communicated_pickup: r.outcome.communicated_pickup.get(&k).copied(),
                })
                .collect();
            root["routes"] = routes.into();
            root["requests"] = requests.into();
            root["fixed_arcs"] = r.outcome.fixed_arc_history.clone().into();
        }
        root
    }
}

impl Report for BatchReport {
    fn to_json(&self) -> json::JsonValue {
        self.0.iter().map(InstanceReport::record).collect_vec().into()
    }

    fn to_json_summary(&self) -> json::JsonValue {
        self.0.iter().map(InstanceReport::summary_record).collect_vec().into()
    }
}


fn main() -> Result<()> {
    let args: ClArgs = StructOpt::from_args();
    let _g = init_logging(args.output.log.as_ref())?;
    debug!(?args);
    ThreadPoolBuilder::new().num_threads(args.cpus).build_global()?;

    let mode = args.distance_mode()?;
    let dynamic = args.dynamic_config();
    let config = args.rh_config();
    let paths = args.instance_paths()?;

    let reports: Vec<InstanceReport> = paths.par_iter()
        .map(|path| {
            let name = path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let result = run_instance(path, &mode, dynamic.as_ref(), &config);
            if let Err(e) = &result {
                error!(instance=%name, "{:#}", e);
            }
            InstanceReport { name, result }
        })
        .collect();

    let failed = reports.iter().filter(|r| r.result.is_err()).count();
    info!(instances=reports.len(), failed, "batch finished");
    output_report(&args.output, &BatchReport(reports))?;
    Ok(())
}
