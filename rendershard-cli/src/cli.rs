use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use shard_protocol::{Codec, FrameRange, ImageFormat};

#[derive(Parser, Debug)]
#[command(
    name = "rendershard",
    version,
    about = "Render compositions in parallel chunks on a local directory store"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding the buckets
    #[arg(long, global = true, env = "RENDERSHARD_STORE_DIR", default_value = "rendershard-data")]
    pub store_dir: PathBuf,

    /// JSON config file, overlaid by RENDERSHARD_* variables
    #[arg(long, global = true, env = "RENDERSHARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Render a video and wait for the output
    Render {
        /// URL of the bundle to render
        serve_url: String,

        /// Composition id
        composition: String,

        #[arg(long, value_enum, default_value_t = CodecArg::H264)]
        codec: CodecArg,

        #[arg(long)]
        frames_per_lambda: Option<u32>,

        /// Inclusive range, e.g. `0-99`
        #[arg(long, value_parser = parse_frame_range)]
        frames: Option<FrameRange>,

        #[arg(long, default_value_t = 1)]
        every_nth_frame: u32,

        /// Input props as a JSON object
        #[arg(long)]
        props: Option<String>,

        #[arg(long)]
        bucket: Option<String>,

        #[arg(long, default_value_t = 1)]
        max_retries: u32,

        /// Return after starting instead of waiting for the output
        #[arg(long)]
        no_wait: bool,
    },

    /// Render a single frame
    Still {
        serve_url: String,

        composition: String,

        /// Frame to render. Negative values count from the end.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        frame: i64,

        #[arg(long, value_enum, default_value_t = ImageFormatArg::Png)]
        image_format: ImageFormatArg,

        #[arg(long)]
        props: Option<String>,

        #[arg(long)]
        bucket: Option<String>,
    },

    /// Show the progress of a render
    Status {
        render_id: String,

        #[arg(long)]
        bucket: Option<String>,
    },

    /// List the compositions of a bundle
    Compositions {
        serve_url: String,

        #[arg(long)]
        props: Option<String>,
    },

    /// Print the version of the workers
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CodecArg {
    H264,
    H265,
    Vp8,
    Vp9,
    Prores,
    Gif,
    Mp3,
    Aac,
    Wav,
}

impl From<CodecArg> for Codec {
    fn from(value: CodecArg) -> Self {
        match value {
            CodecArg::H264 => Codec::H264,
            CodecArg::H265 => Codec::H265,
            CodecArg::Vp8 => Codec::Vp8,
            CodecArg::Vp9 => Codec::Vp9,
            CodecArg::Prores => Codec::Prores,
            CodecArg::Gif => Codec::Gif,
            CodecArg::Mp3 => Codec::Mp3,
            CodecArg::Aac => Codec::Aac,
            CodecArg::Wav => Codec::Wav,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImageFormatArg {
    Png,
    Jpeg,
    Webp,
    Pdf,
}

impl From<ImageFormatArg> for ImageFormat {
    fn from(value: ImageFormatArg) -> Self {
        match value {
            ImageFormatArg::Png => ImageFormat::Png,
            ImageFormatArg::Jpeg => ImageFormat::Jpeg,
            ImageFormatArg::Webp => ImageFormat::Webp,
            ImageFormatArg::Pdf => ImageFormat::Pdf,
        }
    }
}

fn parse_frame_range(value: &str) -> Result<FrameRange, String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got `{value}`"))?;
    let start = start
        .trim()
        .parse()
        .map_err(|e| format!("invalid start frame `{start}`: {e}"))?;
    let end = end
        .trim()
        .parse()
        .map_err(|e| format!("invalid end frame `{end}`: {e}"))?;
    Ok(FrameRange(start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_range() {
        assert_eq!(parse_frame_range("0-99"), Ok(FrameRange(0, 99)));
        assert_eq!(parse_frame_range(" 10 - 20 "), Ok(FrameRange(10, 20)));
        assert!(parse_frame_range("10").is_err());
        assert!(parse_frame_range("a-5").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "rendershard",
            "render",
            "https://example.com/site",
            "main",
            "--frames",
            "0-59",
            "--codec",
            "gif",
        ])
        .unwrap();
        match args.command {
            Commands::Render { frames, codec, .. } => {
                assert_eq!(frames, Some(FrameRange(0, 59)));
                assert_eq!(codec, CodecArg::Gif);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
