use argp::FromArgs;

/// A new way to modify UEFI firmware.
#[derive(FromArgs, Debug)]
pub struct Vulcan {
    /// Logging level (1 = error, 2 = warn, 3 = info, 4 = debug, 5 = trace)
    #[argp(option, short = 'v', default = "0")]
    pub verbose: usize,

    #[argp(subcommand)]
    pub nested: Modules,
}

#[derive(FromArgs, Debug)]
#[argp(subcommand)]
pub enum Modules {
    Parse(ParseData),
    Extract(ExtractData),
    Search(SearchData),
    Repack(RepackData),
    Compress(CompressOption),
}

/// Parse a firmware image and print its tree and messages
#[derive(FromArgs, Debug)]
#[argp(subcommand, name = "parse")]
pub struct ParseData {
    /// Input image to be processed
    #[argp(option, short = 'i')]
    pub input: String,
}

/// Recursively extract a firmware image to a directory
#[derive(FromArgs, Debug)]
#[argp(subcommand, name = "extract")]
pub struct ExtractData {
    /// Input image to be processed
    #[argp(option, short = 'i')]
    pub input: String,

    /// Output directory to write to
    #[argp(option, short = 'o')]
    pub output: Option<String>,

    /// Only extract subtrees of the file with this GUID
    #[argp(option)]
    pub guid: Option<String>,
}

/// Search a firmware image for hex, GUID or text patterns
#[derive(FromArgs, Debug)]
#[argp(subcommand, name = "search")]
pub struct SearchData {
    /// Input image to be processed
    #[argp(option, short = 'i')]
    pub input: String,

    /// Hex pattern to search for, with '.' as a nibble placeholder
    #[argp(option)]
    pub hex: Option<String>,

    /// GUID to search for, in registry format
    #[argp(option)]
    pub guid: Option<String>,

    /// Text to search for
    #[argp(option)]
    pub text: Option<String>,

    /// Interpret text as UTF-16 instead of ASCII
    #[argp(switch, short = 'u')]
    pub unicode: bool,

    /// Case-sensitive text search
    #[argp(switch, short = 'c')]
    pub case_sensitive: bool,

    /// Where to search: header, body or all
    #[argp(option, default = "String::from(\"all\")")]
    pub scope: String,
}

/// Parse and reassemble an image, verifying the round trip
#[derive(FromArgs, Debug)]
#[argp(subcommand, name = "repack")]
pub struct RepackData {
    /// Input image to be processed
    #[argp(option, short = 'i')]
    pub input: String,

    /// Output file to write to
    #[argp(option, short = 'o')]
    pub output: Option<String>,
}

/// Support for the raw section compression formats
#[derive(FromArgs, Debug)]
#[argp(subcommand, name = "compress")]
pub struct CompressOption {
    #[argp(subcommand)]
    pub nested: CompressModules,
}

#[derive(FromArgs, Debug)]
#[argp(subcommand)]
pub enum CompressModules {
    Tiano(TianoData),
    Lzma(LzmaData),
}

/// EFI 1.1 / Tiano compression
#[derive(FromArgs, Debug)]
#[argp(subcommand, name = "tiano")]
pub struct TianoData {
    /// Decompress a Tiano/EFI 1.1 compressed stream
    #[argp(switch, short = 'd')]
    pub decompress: bool,

    /// Compress into a Tiano stream
    #[argp(switch, short = 'c')]
    pub compress: bool,

    /// Use the EFI 1.1 window instead of the Tiano one when compressing
    #[argp(switch)]
    pub efi11: bool,

    /// Input file to be processed
    #[argp(option, short = 'i')]
    pub input: String,

    /// Output file to write to
    #[argp(option, short = 'o')]
    pub output: Option<String>,
}

/// LZMA compression with the EFI framing
#[derive(FromArgs, Debug)]
#[argp(subcommand, name = "lzma")]
pub struct LzmaData {
    /// Decompress an LZMA stream
    #[argp(switch, short = 'd')]
    pub decompress: bool,

    /// Compress into an LZMA stream
    #[argp(switch, short = 'c')]
    pub compress: bool,

    /// Dictionary size to record in the stream header
    #[argp(option, default = "0x800000")]
    pub dictionary_size: u32,

    /// Input file to be processed
    #[argp(option, short = 'i')]
    pub input: String,

    /// Output file to write to
    #[argp(option, short = 'o')]
    pub output: Option<String>,
}

pub fn exactly_one_true(bools: &[bool]) -> Option<usize> {
    let mut count = 0;
    let mut index = 0;

    for (i, &val) in bools.iter().enumerate() {
        if val {
            count += 1;
            index = i;
        }

        if count > 1 {
            return None;
        }
    }

    if count == 1 {
        Some(index)
    } else {
        None
    }
}
