// Copyright 2018-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn check(output: Output) {
    if !output.status.success() {
        eprintln!("status: {}", output.status);
        eprintln!("stdout: {}", String::from_utf8_lossy(&output.stdout));
        eprintln!("stderr: {}", String::from_utf8_lossy(&output.stderr));
        panic!();
    }
}

fn main() {
    println!("cargo:rerun-if-changed=cudautils/dense_hash_join.cu");

    // Host-only builds don't need nvcc
    if env::var_os("CARGO_FEATURE_CUDA").is_none() {
        return;
    }

    let out_dir = env::var("OUT_DIR").unwrap();

    let cuda_lib_file = format!("{}/cudautils.fatbin", out_dir);
    let cuda_files = vec!["cudautils/dense_hash_join.cu"];
    let nvcc_build_args = vec!["--device-c", "-std=c++11", "--output-directory", &out_dir];
    let nvcc_link_args = vec!["--device-link", "-fatbin", "--output-file", &cuda_lib_file];

    // For gencodes, see: http://arnon.dk/matching-sm-architectures-arch-and-gencode-for-various-nvidia-cards/
    let gpu_archs = vec![
        "-gencode",
        "arch=compute_50,code=sm_50", // GTX 940M
        "-gencode",
        "arch=compute_52,code=sm_52", // GTX 980
        "-gencode",
        "arch=compute_61,code=sm_61", // GTX 1080
        "-gencode",
        "arch=compute_70,code=sm_70", // Tesla V100
        "-gencode",
        "arch=compute_80,code=sm_80", // A100
    ];

    check(
        Command::new("nvcc")
            .args(cuda_files.as_slice())
            .args(nvcc_build_args.as_slice())
            .args(gpu_archs.as_slice())
            .output()
            .expect("Couldn't execute nvcc"),
    );

    let cuda_object_files: Vec<_> = cuda_files
        .iter()
        .map(|f| {
            let p = Path::new(f);
            let mut obj = PathBuf::new();
            obj.push(&out_dir);
            obj.push(p.file_stem().unwrap());
            obj.set_extension("o");
            obj
        })
        .collect();

    check(
        Command::new("nvcc")
            .args(cuda_object_files.as_slice())
            .args(nvcc_link_args.as_slice())
            .args(gpu_archs.as_slice())
            .output()
            .expect("Couldn't execute nvcc"),
    );

    println!("cargo:rustc-env=CUDAUTILS_PATH={}", cuda_lib_file);
    println!("cargo:rustc-link-search=native=/opt/cuda/lib64");
    println!("cargo:rustc-link-search=native=/usr/local/cuda/lib64");
    println!("cargo:rustc-link-lib=cuda");
}
